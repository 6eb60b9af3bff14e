//! CLI application for talky

mod app;
mod share;

use anyhow::Result;
use app::{ui, Action, App};
use clap::{Parser, Subcommand};
use crossterm::{
    event::{
        self, Event, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
        PushKeyboardEnhancementFlags,
    },
    execute,
    terminal::{
        disable_raw_mode, enable_raw_mode, supports_keyboard_enhancement, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
};
use log::{debug, error, info, warn};
use network::{SilentSource, WebRtcPeerFactory};
use ratatui::{backend::CrosstermBackend, Terminal};
use room::{RoomConfig, RoomHandler, RoomServices};
use room_core::{ClientId, RoomCode, RoomCommand, RoomEvent, SharedClock, SystemClock, Topology};
use settings_manager::{ConfigManager, IdentityStore, Settings};
use std::{
    io::{self, Stdout},
    sync::Arc,
    time::Duration,
};
use store::MemoryStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// talky - push-to-talk voice rooms
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Enable debug logging
    #[clap(short, long, global = true)]
    debug: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a room code and print its share link and QR code
    New {
        /// Use an opaque token for a mesh room instead of a 4 digit pin
        #[clap(long)]
        mesh: bool,

        /// Also copy the link to the clipboard
        #[clap(long)]
        copy: bool,
    },

    /// Run two clients in one room inside this process
    Demo {
        /// Room code to join, a new one is generated when omitted
        #[clap(long)]
        room: Option<String>,

        /// Use the mesh layout
        #[clap(long)]
        mesh: bool,
    },
}

struct DemoClient {
    commands: mpsc::Sender<RoomCommand>,
    events: mpsc::Receiver<RoomEvent>,
    task: JoinHandle<()>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configure logging based on debug flag
    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
    debug!("Debug logging enabled");

    let config = ConfigManager::new()?;
    info!("Loaded settings from {:?}", config.config_file());

    match args.command {
        Command::New { mesh, copy } => new_room(config.settings(), mesh, copy),
        Command::Demo { room, mesh } => run_demo(config.settings().clone(), room, mesh).await,
    }
}

fn generate_code(topology: Topology) -> RoomCode {
    match topology {
        Topology::TwoParty => RoomCode::generate_pin(),
        Topology::Mesh => RoomCode::generate_token(),
    }
}

/// Room code from user input. Pins tolerate separators and extra digits.
fn typed_code(raw: &str, topology: Topology) -> Result<RoomCode> {
    let code = match topology {
        Topology::TwoParty => RoomCode::parse(&RoomCode::normalize_pin_input(raw))?,
        Topology::Mesh => RoomCode::parse(raw)?,
    };
    Ok(code)
}

fn new_room(settings: &Settings, mesh: bool, copy: bool) -> Result<()> {
    let topology = if mesh { Topology::Mesh } else { settings.topology };
    let code = generate_code(topology);
    let link = code.share_link(&settings.share_base_url);

    println!("Room code: {}", code);
    println!("{}", link);
    println!();
    println!("{}", share::qr_text(&link)?);

    if copy {
        match share::copy_to_clipboard(&link) {
            Ok(()) => println!("Link copied to clipboard"),
            Err(e) => warn!("{}", e),
        }
    }
    Ok(())
}

fn spawn_client(
    config: &RoomConfig,
    client_id: ClientId,
    name: &str,
    store: &MemoryStore,
    clock: &SharedClock,
    ice_servers: &[String],
) -> Result<DemoClient> {
    let (commands, command_rx) = mpsc::channel(32);
    let (event_tx, events) = mpsc::channel(256);
    let services = RoomServices {
        store: Arc::new(store.clone()),
        clock: clock.clone(),
        peers: Arc::new(WebRtcPeerFactory::new(ice_servers)?),
        audio: Arc::new(SilentSource::new(name)),
    };
    let mut handler = RoomHandler::new(config.clone(), client_id, services, command_rx, event_tx);
    let name = name.to_string();
    let task = tokio::spawn(async move {
        if let Err(e) = handler.run().await {
            error!("Client {} stopped: {}", name, e);
        }
    });
    Ok(DemoClient {
        commands,
        events,
        task,
    })
}

async fn run_demo(settings: Settings, room: Option<String>, mesh: bool) -> Result<()> {
    let topology = if mesh { Topology::Mesh } else { settings.topology };
    let settings = Settings {
        topology,
        ..settings
    };
    settings.validate()?;

    let code = match room {
        Some(raw) => typed_code(&raw, topology)?,
        None => generate_code(topology),
    };
    let link = code.share_link(&settings.share_base_url);
    let config = RoomConfig {
        code: code.clone(),
        topology,
        max_participants: settings.max_participants(),
        timings: settings.timings(),
    };
    info!("Starting demo in room {} ({:?})", code, topology);

    let local_id = match IdentityStore::new() {
        Ok(identity) => identity.load_or_create(),
        Err(e) => {
            warn!("No identity store: {}", e);
            ClientId::new()
        }
    };
    let store = MemoryStore::new();
    let clock: SharedClock = Arc::new(SystemClock);
    let mut clients = vec![spawn_client(&config, local_id, "a", &store, &clock, &settings.ice_servers)?];
    clients.push(spawn_client(
        &config,
        ClientId::new(),
        "b",
        &store,
        &clock,
        &settings.ice_servers,
    )?);

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let release_events = matches!(supports_keyboard_enhancement(), Ok(true));
    if release_events {
        execute!(
            stdout,
            PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
        )?;
    }
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let mut app = App::new(code, link, release_events);
    let result = event_loop(&mut terminal, &mut app, &mut clients).await;

    // Restore terminal
    if release_events {
        execute!(terminal.backend_mut(), PopKeyboardEnhancementFlags)?;
    }
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    for client in &clients {
        let _ = client.commands.send(RoomCommand::Leave).await;
    }
    for client in clients {
        let DemoClient { events, task, .. } = client;
        drop(events);
        if tokio::time::timeout(Duration::from_secs(3), task).await.is_err() {
            warn!("A client did not leave in time");
        }
    }
    info!("Exiting talky");
    result
}

async fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
    clients: &mut [DemoClient],
) -> Result<()> {
    let tick_rate = Duration::from_millis(50);
    loop {
        for (index, client) in clients.iter_mut().enumerate() {
            while let Ok(event) = client.events.try_recv() {
                app.apply(index, event);
            }
        }

        terminal.draw(|f| ui(f, app))?;

        if event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                for action in app.handle_key(key) {
                    match action {
                        Action::Room { client, command } => {
                            if let Err(e) = clients[client].commands.try_send(command) {
                                warn!("Command for client {} dropped: {}", client, e);
                            }
                        }
                        Action::CopyLink => {
                            app.notice = Some(match share::copy_to_clipboard(&app.link) {
                                Ok(()) => "Link copied".to_string(),
                                Err(e) => e.to_string(),
                            });
                        }
                        Action::Quit => {}
                    }
                }
            }
        }

        if app.should_quit {
            return Ok(());
        }
        // Let the room tasks run between frames
        tokio::task::yield_now().await;
    }
}
