//! Terminal state and rendering for the two-client demo

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph},
    Frame,
};
use room_core::{
    CallStatus, JoinRejection, PeerConnectionState, RoomCode, RoomCommand, RoomEvent, Seat,
};
use std::collections::BTreeMap;

/// What the main loop should do after a key press
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Room { client: usize, command: RoomCommand },
    CopyLink,
    Quit,
}

/// Everything one client's panel shows
#[derive(Debug, Clone)]
pub struct ClientPanel {
    pub name: String,
    pub talk_key: char,
    pub seat: Option<Seat>,
    pub status: CallStatus,
    pub active: usize,
    pub max: usize,
    pub holder: Option<Seat>,
    pub transmitting: bool,
    pub busy: Option<String>,
    pub error: Option<String>,
    pub peers: BTreeMap<String, PeerConnectionState>,
    pub receiving_from: Vec<String>,
    pub left: bool,
    key_down: bool,
}

impl ClientPanel {
    pub fn new(name: &str, talk_key: char) -> Self {
        Self {
            name: name.to_string(),
            talk_key,
            seat: None,
            status: CallStatus::Joining,
            active: 0,
            max: 0,
            holder: None,
            transmitting: false,
            busy: None,
            error: None,
            peers: BTreeMap::new(),
            receiving_from: Vec::new(),
            left: false,
            key_down: false,
        }
    }

    pub fn apply(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::Joined(seat) => self.seat = Some(seat),
            RoomEvent::JoinRejected(JoinRejection::Full) => self.error = Some("Room is full".to_string()),
            RoomEvent::JoinRejected(JoinRejection::Error(message)) => self.error = Some(message),
            RoomEvent::StatusChanged(status) => self.status = status,
            RoomEvent::ParticipantsChanged { active, max } => {
                self.active = active;
                self.max = max;
            }
            RoomEvent::PeerStateChanged { peer, state } => {
                self.peers.insert(peer.to_string(), state);
            }
            RoomEvent::RemoteTrack { peer, .. } => {
                let peer = peer.to_string();
                if !self.receiving_from.contains(&peer) {
                    self.receiving_from.push(peer);
                }
            }
            RoomEvent::PttHolderChanged(holder) => self.holder = holder,
            RoomEvent::TransmitChanged(on) => {
                self.transmitting = on;
                if !on {
                    self.key_down = false;
                }
            }
            RoomEvent::Busy(message) => {
                // A refused press leaves nothing to release
                if message.is_some() && !self.transmitting {
                    self.key_down = false;
                }
                self.busy = message;
            }
            RoomEvent::Error(message) => self.error = Some(message),
            RoomEvent::Left => {
                self.left = true;
                self.transmitting = false;
                self.peers.clear();
            }
        }
    }

    fn channel_span(&self) -> Span<'static> {
        if self.transmitting {
            return Span::styled(
                "Talking",
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            );
        }
        match &self.holder {
            None => Span::styled("Free", Style::default().fg(Color::Green)),
            Some(holder) if Some(holder) == self.seat.as_ref() => Span::raw("Held by you"),
            Some(holder) => Span::styled(
                format!("{} is talking", holder),
                Style::default().fg(Color::Yellow),
            ),
        }
    }
}

/// App state
pub struct App {
    pub code: RoomCode,
    pub link: String,
    pub clients: Vec<ClientPanel>,
    /// Whether the terminal reports key releases. Without them the talk
    /// keys toggle.
    pub release_events: bool,
    pub notice: Option<String>,
    pub should_quit: bool,
}

impl App {
    pub fn new(code: RoomCode, link: String, release_events: bool) -> Self {
        Self {
            code,
            link,
            clients: vec![ClientPanel::new("A", ' '), ClientPanel::new("B", 'g')],
            release_events,
            notice: None,
            should_quit: false,
        }
    }

    pub fn apply(&mut self, client: usize, event: RoomEvent) {
        if let Some(panel) = self.clients.get_mut(client) {
            panel.apply(event);
        }
    }

    /// Map a key event to actions
    pub fn handle_key(&mut self, key: KeyEvent) -> Vec<Action> {
        let talk_client = match key.code {
            KeyCode::Char(c) => self.clients.iter().position(|p| p.talk_key == c),
            _ => None,
        };
        if let Some(client) = talk_client {
            return self.talk_key(client, key.kind).into_iter().collect();
        }

        if key.kind == KeyEventKind::Release {
            return Vec::new();
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
                vec![Action::Quit]
            }
            KeyCode::Char('c') => vec![Action::CopyLink],
            _ => Vec::new(),
        }
    }

    fn talk_key(&mut self, client: usize, kind: KeyEventKind) -> Option<Action> {
        let release_events = self.release_events;
        let panel = &mut self.clients[client];
        let command = match (release_events, kind) {
            (_, KeyEventKind::Repeat) => return None,
            (true, KeyEventKind::Press) if !panel.key_down => RoomCommand::Press,
            (true, KeyEventKind::Release) if panel.key_down => RoomCommand::Release,
            (true, _) => return None,
            (false, KeyEventKind::Press) if panel.key_down => RoomCommand::Release,
            (false, KeyEventKind::Press) => RoomCommand::Press,
            (false, _) => return None,
        };
        panel.key_down = command == RoomCommand::Press;
        Some(Action::Room { client, command })
    }
}

pub fn ui(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([Constraint::Length(6), Constraint::Min(8)])
        .split(f.size());

    let talk_hint = if app.release_events {
        "hold space (A) or g (B) to talk"
    } else {
        "space (A) or g (B) toggles talking"
    };
    let mut header = vec![
        Line::from(vec![
            Span::styled("talky", Style::default().fg(Color::Green)),
            Span::raw(format!(" - Room {}", app.code)),
        ]),
        Line::raw(app.link.clone()),
        Line::raw(format!("{}, 'c' copies the link, 'q' quits", talk_hint)),
    ];
    if let Some(notice) = &app.notice {
        header.push(Line::raw(notice.clone()));
    }
    let menu = Paragraph::new(Text::from(header))
        .block(Block::default().title("Room").borders(Borders::ALL));
    f.render_widget(menu, chunks[0]);

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(vec![
            Constraint::Ratio(1, app.clients.len().max(1) as u32);
            app.clients.len()
        ])
        .split(chunks[1]);
    for (panel, area) in app.clients.iter().zip(columns.iter()) {
        render_panel(f, panel, *area);
    }
}

fn render_panel(f: &mut Frame, panel: &ClientPanel, area: Rect) {
    let seat = panel
        .seat
        .as_ref()
        .map(|seat| seat.to_string())
        .unwrap_or_else(|| "-".to_string());
    let status = if panel.left {
        "Left".to_string()
    } else {
        panel.status.label().to_string()
    };

    let mut lines = vec![
        Line::raw(format!("Seat: {}", seat)),
        Line::raw(format!("Status: {}", status)),
        Line::raw(format!("Participants: {}/{}", panel.active, panel.max)),
        Line::from(vec![Span::raw("Channel: "), panel.channel_span()]),
    ];
    if panel.peers.is_empty() {
        lines.push(Line::raw("No peers connected"));
    }
    for (peer, state) in &panel.peers {
        let receiving = if panel.receiving_from.contains(peer) {
            " (audio)"
        } else {
            ""
        };
        lines.push(Line::raw(format!("{}: {}{}", peer, state, receiving)));
    }
    if let Some(busy) = &panel.busy {
        lines.push(Line::from(Span::styled(
            busy.clone(),
            Style::default().fg(Color::Yellow),
        )));
    }
    if let Some(error) = &panel.error {
        lines.push(Line::from(Span::styled(
            error.clone(),
            Style::default().fg(Color::Red),
        )));
    }

    let title = format!("Client {}", panel.name);
    let widget =
        Paragraph::new(Text::from(lines)).block(Block::default().title(title).borders(Borders::ALL));
    f.render_widget(widget, area);
}
