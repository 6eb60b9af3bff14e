//! Peer session orchestration
//!
//! One task owns every peer connection of the local client. Presence
//! updates, inbound signals, connection callbacks and offer timers are all
//! turned into messages on its channels, so the per-peer state below is
//! only ever touched from `run`.
//!
//! Per remote peer: absent -> connecting -> connected -> (failed |
//! disconnected | closed) -> connecting with a new session, or absent once
//! the peer is no longer active.

use log::{debug, info, trace, warn};
use room_core::{Error, PeerConnectionState, Seat, SessionId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::peer::{
    IceCandidate, PeerConnection, PeerConnectionFactory, PeerEvent, SdpType, SessionDescription,
};
use crate::signaling::{InboundSignal, PeerSignals, SignalPayload, SignalingExchange};
use crate::webrtc_audio::LocalAudioTrack;

/// Candidates kept per peer while no matching remote description is set.
pub const MAX_EARLY_CANDIDATES: usize = 64;

/// Message shown when a connection could not be started.
pub const CONNECTION_FAILED: &str = "Connection failed";

/// Commands from the room controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorCommand {
    /// Remote seats that are currently active
    Presence(Vec<Seat>),

    /// Close every connection and stop
    Shutdown,
}

/// Events for the room controller
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    PeerState {
        peer: Seat,
        state: PeerConnectionState,
    },
    RemoteTrack {
        peer: Seat,
        track_id: String,
    },
    /// Transient message for the user
    Busy(String),
    /// The peer is gone and its connection was closed
    PeerRemoved(Seat),
}

enum Internal {
    Signal {
        peer: Seat,
        signal: InboundSignal,
    },
    Peer {
        peer: Seat,
        generation: u64,
        event: PeerEvent,
    },
    OfferDue {
        peer: Seat,
        token: u64,
    },
}

struct ActiveConnection {
    /// Tags callbacks so events of a replaced connection are ignored
    generation: u64,
    session_id: SessionId,
    pc: Arc<dyn PeerConnection>,
    events_task: JoinHandle<()>,
    state: PeerConnectionState,
    offering: bool,
    remote_set: bool,
}

struct PeerSession {
    signals_task: JoinHandle<()>,
    connection: Option<ActiveConnection>,
    offer_timer: Option<(u64, JoinHandle<()>)>,
    early_candidates: VecDeque<(SessionId, IceCandidate)>,
    /// Offer that arrived while a healthy session was up
    deferred_offer: Option<(SessionId, SessionDescription)>,
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.signals_task.abort();
        if let Some((_, timer)) = self.offer_timer.take() {
            timer.abort();
        }
        if let Some(conn) = &self.connection {
            conn.events_task.abort();
        }
    }
}

/// Owns the peer connections of one local client
pub struct Orchestrator {
    local: Seat,
    signaling: SignalingExchange,
    factory: Arc<dyn PeerConnectionFactory>,
    track: LocalAudioTrack,
    offer_debounce: Duration,
    peers: HashMap<Seat, PeerSession>,
    retired: HashMap<Seat, HashSet<SessionId>>,
    next_generation: u64,
    command_rx: mpsc::Receiver<OrchestratorCommand>,
    event_tx: mpsc::Sender<OrchestratorEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl Orchestrator {
    pub fn new(
        signaling: SignalingExchange,
        factory: Arc<dyn PeerConnectionFactory>,
        track: LocalAudioTrack,
        offer_debounce: Duration,
        command_rx: mpsc::Receiver<OrchestratorCommand>,
        event_tx: mpsc::Sender<OrchestratorEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            local: signaling.local().clone(),
            signaling,
            factory,
            track,
            offer_debounce,
            peers: HashMap::new(),
            retired: HashMap::new(),
            next_generation: 0,
            command_rx,
            event_tx,
            internal_tx,
            internal_rx,
        }
    }

    /// Process commands and peer activity until shutdown
    pub async fn run(&mut self) -> Result<(), Error> {
        info!("Orchestrator started for {}", self.local);
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(OrchestratorCommand::Presence(active)) => self.handle_presence(active).await,
                    Some(OrchestratorCommand::Shutdown) | None => break,
                },

                Some(message) = self.internal_rx.recv() => self.handle_internal(message).await,
            }
        }

        let peers: Vec<Seat> = self.peers.keys().cloned().collect();
        for peer in peers {
            self.remove_peer(&peer).await;
        }
        info!("Orchestrator for {} stopped", self.local);
        Ok(())
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Signal { peer, signal } => self.handle_signal(&peer, signal).await,
            Internal::Peer {
                peer,
                generation,
                event,
            } => self.handle_peer_event(&peer, generation, event).await,
            Internal::OfferDue { peer, token } => self.handle_offer_due(&peer, token).await,
        }
    }

    async fn handle_presence(&mut self, active: Vec<Seat>) {
        let active: HashSet<Seat> = active
            .into_iter()
            .filter(|seat| seat != &self.local)
            .collect();

        let gone: Vec<Seat> = self
            .peers
            .keys()
            .filter(|seat| !active.contains(*seat))
            .cloned()
            .collect();
        for peer in gone {
            info!("Peer {} is no longer active", peer);
            self.remove_peer(&peer).await;
            self.emit(OrchestratorEvent::PeerRemoved(peer)).await;
        }

        for peer in active {
            if !self.peers.contains_key(&peer) {
                let signals = match self.signaling.subscribe(&peer) {
                    Ok(signals) => signals,
                    Err(e) => {
                        warn!("Failed to subscribe to signals from {}: {}", peer, e);
                        continue;
                    }
                };
                info!("Peer {} became active", peer);
                let signals_task = self.spawn_signal_forwarder(peer.clone(), signals);
                self.peers.insert(
                    peer.clone(),
                    PeerSession {
                        signals_task,
                        connection: None,
                        offer_timer: None,
                        early_candidates: VecDeque::new(),
                        deferred_offer: None,
                    },
                );
            }
            self.schedule_offer(&peer);
        }
    }

    fn spawn_signal_forwarder(&self, peer: Seat, mut signals: PeerSignals) -> JoinHandle<()> {
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let message = Internal::Signal {
                    peer: peer.clone(),
                    signal,
                };
                if internal.send(message).is_err() {
                    break;
                }
            }
        })
    }

    /// Arm the debounce timer if we initiate with `peer` and have nothing
    /// in flight.
    fn schedule_offer(&mut self, peer: &Seat) {
        if !self.local.offers_to(peer) {
            return;
        }
        self.next_generation += 1;
        let token = self.next_generation;
        let Some(session) = self.peers.get_mut(peer) else {
            return;
        };
        if session.connection.is_some() || session.offer_timer.is_some() {
            return;
        }

        let internal = self.internal_tx.clone();
        let debounce = self.offer_debounce;
        let target = peer.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let _ = internal.send(Internal::OfferDue {
                peer: target,
                token,
            });
        });
        trace!("Offer to {} scheduled in {:?}", peer, debounce);
        session.offer_timer = Some((token, timer));
    }

    async fn handle_offer_due(&mut self, peer: &Seat, token: u64) {
        let Some(session) = self.peers.get_mut(peer) else {
            return;
        };
        let armed = matches!(&session.offer_timer, Some((armed, _)) if *armed == token);
        if !armed {
            return;
        }
        session.offer_timer = None;
        if session.connection.is_some() {
            return;
        }

        let session_id = SessionId::new();
        if let Err(e) = self.start_offer(peer, &session_id).await {
            warn!("Failed to start connection with {}: {}", peer, e);
            self.teardown_connection(peer).await;
            self.emit(OrchestratorEvent::Busy(CONNECTION_FAILED.to_string()))
                .await;
        }
    }

    async fn start_offer(&mut self, peer: &Seat, session_id: &SessionId) -> Result<(), Error> {
        let pc = self.open_connection(peer, session_id, true).await?;
        let offer = pc.create_offer().await?;
        pc.set_local_description(offer.clone()).await?;
        self.signaling
            .publish_description(peer, session_id, &offer)
            .await?;
        info!("Sent offer {} to {}", session_id, peer);
        Ok(())
    }

    async fn accept_offer(
        &mut self,
        peer: &Seat,
        session_id: &SessionId,
        offer: SessionDescription,
    ) -> Result<(), Error> {
        let pc = self.open_connection(peer, session_id, false).await?;
        pc.set_remote_description(offer).await?;
        self.remote_description_applied(peer, session_id, &pc).await;

        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;
        self.signaling
            .publish_description(peer, session_id, &answer)
            .await?;
        info!("Answered offer {} from {}", session_id, peer);
        Ok(())
    }

    /// Create a connection for `peer`, wire its callbacks and attach the
    /// local track. The connection is registered before the track is added
    /// so a failure can be torn down like any other.
    async fn open_connection(
        &mut self,
        peer: &Seat,
        session_id: &SessionId,
        offering: bool,
    ) -> Result<Arc<dyn PeerConnection>, Error> {
        if !self.peers.contains_key(peer) {
            return Err(Error::InvalidState(format!("{} is not an active peer", peer)));
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let pc = self.factory.create(peer, events_tx).await?;

        let internal = self.internal_tx.clone();
        let source = peer.clone();
        let events_task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let message = Internal::Peer {
                    peer: source.clone(),
                    generation,
                    event,
                };
                if internal.send(message).is_err() {
                    break;
                }
            }
        });

        let connection = ActiveConnection {
            generation,
            session_id: session_id.clone(),
            pc: pc.clone(),
            events_task,
            state: PeerConnectionState::New,
            offering,
            remote_set: false,
        };
        match self.peers.get_mut(peer) {
            Some(session) => session.connection = Some(connection),
            None => {
                connection.events_task.abort();
                return Err(Error::InvalidState(format!("{} went away", peer)));
            }
        }

        pc.add_local_track(&self.track).await?;
        Ok(pc)
    }

    async fn handle_signal(&mut self, peer: &Seat, signal: InboundSignal) {
        if !self.peers.contains_key(peer) {
            return;
        }
        if self.is_retired(peer, &signal.session_id) {
            debug!(
                "Dropping {} from {}: session {} is retired",
                signal.record_id, peer, signal.session_id
            );
            return;
        }

        match signal.payload {
            SignalPayload::Description(desc) => match desc.sdp_type {
                SdpType::Offer => self.handle_offer(peer, signal.session_id, desc).await,
                SdpType::Answer => self.handle_answer(peer, signal.session_id, desc).await,
            },
            SignalPayload::Candidate(candidate) => {
                self.handle_candidate(peer, signal.session_id, candidate)
                    .await
            }
        }
    }

    async fn handle_offer(
        &mut self,
        peer: &Seat,
        session_id: SessionId,
        offer: SessionDescription,
    ) {
        let Some(session) = self.peers.get_mut(peer) else {
            return;
        };
        if let Some(conn) = &session.connection {
            if conn.session_id == session_id {
                debug!("Ignoring repeated offer {} from {}", session_id, peer);
                return;
            }
            if conn.state == PeerConnectionState::Connected {
                debug!(
                    "Deferring offer {} from {} while session {} is connected",
                    session_id, peer, conn.session_id
                );
                session.deferred_offer = Some((session_id, offer));
                return;
            }
        }
        session.deferred_offer = None;

        self.teardown_connection(peer).await;
        if let Err(e) = self.accept_offer(peer, &session_id, offer).await {
            warn!("Failed to answer {} from {}: {}", session_id, peer, e);
            self.teardown_connection(peer).await;
            self.emit(OrchestratorEvent::Busy(CONNECTION_FAILED.to_string()))
                .await;
        }
    }

    async fn handle_answer(
        &mut self,
        peer: &Seat,
        session_id: SessionId,
        answer: SessionDescription,
    ) {
        let pc = match self.peers.get(peer).and_then(|s| s.connection.as_ref()) {
            Some(conn) if conn.session_id == session_id && conn.offering && !conn.remote_set => {
                conn.pc.clone()
            }
            _ => {
                debug!("Ignoring answer {} from {}", session_id, peer);
                return;
            }
        };

        if let Err(e) = pc.set_remote_description(answer).await {
            warn!("Failed to apply answer {} from {}: {}", session_id, peer, e);
            self.teardown_connection(peer).await;
            self.schedule_offer(peer);
            return;
        }
        debug!("Applied answer {} from {}", session_id, peer);
        self.remote_description_applied(peer, &session_id, &pc).await;
    }

    async fn handle_candidate(
        &mut self,
        peer: &Seat,
        session_id: SessionId,
        candidate: IceCandidate,
    ) {
        let Some(session) = self.peers.get_mut(peer) else {
            return;
        };
        match &session.connection {
            Some(conn) if conn.session_id == session_id && conn.remote_set => {
                let pc = conn.pc.clone();
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    debug!("Dropping candidate from {}: {}", peer, e);
                }
            }
            _ => {
                // Current session without remote description yet, or a
                // session we have not seen an offer or answer for
                if session.early_candidates.len() >= MAX_EARLY_CANDIDATES {
                    session.early_candidates.pop_front();
                }
                trace!("Buffering candidate for session {} from {}", session_id, peer);
                session.early_candidates.push_back((session_id, candidate));
            }
        }
    }

    /// Mark the remote description as set and flush buffered candidates.
    async fn remote_description_applied(
        &mut self,
        peer: &Seat,
        session_id: &SessionId,
        pc: &Arc<dyn PeerConnection>,
    ) {
        let Some(session) = self.peers.get_mut(peer) else {
            return;
        };
        if let Some(conn) = session.connection.as_mut() {
            conn.remote_set = true;
        }
        let (matching, rest): (VecDeque<_>, VecDeque<_>) = session
            .early_candidates
            .drain(..)
            .partition(|(id, _)| id == session_id);
        session.early_candidates = rest;

        if !matching.is_empty() {
            debug!("Flushing {} buffered candidates from {}", matching.len(), peer);
        }
        for (_, candidate) in matching {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                debug!("Dropping buffered candidate from {}: {}", peer, e);
            }
        }
    }

    async fn handle_peer_event(&mut self, peer: &Seat, generation: u64, event: PeerEvent) {
        let Some(conn) = self
            .peers
            .get_mut(peer)
            .and_then(|s| s.connection.as_mut())
        else {
            return;
        };
        if conn.generation != generation {
            trace!("Ignoring event from a replaced connection with {}", peer);
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let session_id = conn.session_id.clone();
                if let Err(e) = self
                    .signaling
                    .publish_candidate(peer, &session_id, &candidate)
                    .await
                {
                    warn!("Failed to publish candidate to {}: {}", peer, e);
                }
            }
            PeerEvent::RemoteTrack { track_id } => {
                info!("Remote audio from {} ({})", peer, track_id);
                self.emit(OrchestratorEvent::RemoteTrack {
                    peer: peer.clone(),
                    track_id,
                })
                .await;
            }
            PeerEvent::StateChanged(state) => {
                if conn.state == state {
                    return;
                }
                conn.state = state;
                info!("Connection with {} is {}", peer, state);
                self.emit(OrchestratorEvent::PeerState {
                    peer: peer.clone(),
                    state,
                })
                .await;

                if state.is_terminal() {
                    self.teardown_connection(peer).await;
                    self.resume_after_teardown(peer).await;
                }
            }
        }
    }

    /// After a teardown, pick up a deferred offer or start over.
    async fn resume_after_teardown(&mut self, peer: &Seat) {
        let deferred = self
            .peers
            .get_mut(peer)
            .and_then(|s| s.deferred_offer.take());
        if let Some((session_id, offer)) = deferred {
            if !self.is_retired(peer, &session_id) {
                self.handle_offer(peer, session_id, offer).await;
                return;
            }
        }
        self.schedule_offer(peer);
    }

    /// Close the connection with `peer`, if any, and retire its session.
    async fn teardown_connection(&mut self, peer: &Seat) {
        let Some(conn) = self
            .peers
            .get_mut(peer)
            .and_then(|s| s.connection.take())
        else {
            return;
        };
        conn.events_task.abort();
        self.retired
            .entry(peer.clone())
            .or_default()
            .insert(conn.session_id.clone());
        debug!("Retired session {} with {}", conn.session_id, peer);

        if let Err(e) = conn.pc.close().await {
            debug!("Error closing connection with {}: {}", peer, e);
        }
    }

    async fn remove_peer(&mut self, peer: &Seat) {
        self.teardown_connection(peer).await;
        // Dropping the session ends its signal feed and timer
        self.peers.remove(peer);
    }

    fn is_retired(&self, peer: &Seat, session_id: &SessionId) -> bool {
        self.retired
            .get(peer)
            .map(|ids| ids.contains(session_id))
            .unwrap_or(false)
    }

    async fn emit(&self, event: OrchestratorEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("Orchestrator event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePeerFactory;
    use room_core::{ClientId, ManualClock, Role, RoomCode, Topology};
    use std::collections::BTreeSet;
    use store::MemoryStore;

    struct Client {
        commands: mpsc::Sender<OrchestratorCommand>,
        events: mpsc::Receiver<OrchestratorEvent>,
        factory: Arc<FakePeerFactory>,
        handle: JoinHandle<Result<(), Error>>,
    }

    fn exchange(
        store: &MemoryStore,
        clock: &ManualClock,
        local: Seat,
        topology: Topology,
    ) -> SignalingExchange {
        SignalingExchange::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            RoomCode::parse("4821").unwrap(),
            local,
            topology,
        )
    }

    fn spawn_client(store: &MemoryStore, clock: &ManualClock, local: Seat) -> Client {
        spawn_in(store, clock, local, Topology::TwoParty)
    }

    fn spawn_in(store: &MemoryStore, clock: &ManualClock, local: Seat, topology: Topology) -> Client {
        let signaling = exchange(store, clock, local, topology);
        let factory = Arc::new(FakePeerFactory::new());
        let (commands, command_rx) = mpsc::channel(16);
        let (event_tx, events) = mpsc::channel(64);
        let mut orchestrator = Orchestrator::new(
            signaling,
            factory.clone(),
            LocalAudioTrack::new("test"),
            Duration::from_millis(350),
            command_rx,
            event_tx,
        );
        let handle = tokio::spawn(async move { orchestrator.run().await });
        Client {
            commands,
            events,
            factory,
            handle,
        }
    }

    async fn wait_for(
        events: &mut mpsc::Receiver<OrchestratorEvent>,
        wanted: impl Fn(&OrchestratorEvent) -> bool,
    ) -> OrchestratorEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("timed out waiting for orchestrator event")
                .expect("orchestrator stopped");
            if wanted(&event) {
                return event;
            }
        }
    }

    fn connected(event: &OrchestratorEvent) -> bool {
        matches!(
            event,
            OrchestratorEvent::PeerState {
                state: PeerConnectionState::Connected,
                ..
            }
        )
    }

    async fn connect_pair() -> (MemoryStore, Client, Client) {
        let store = MemoryStore::new();
        let clock = ManualClock::new(1_000);
        let host = Seat::Role(Role::Host);
        let guest = Seat::Role(Role::Guest);
        let mut a = spawn_client(&store, &clock, host.clone());
        let mut b = spawn_client(&store, &clock, guest.clone());

        a.commands
            .send(OrchestratorCommand::Presence(vec![host.clone(), guest.clone()]))
            .await
            .unwrap();
        b.commands
            .send(OrchestratorCommand::Presence(vec![host, guest]))
            .await
            .unwrap();

        wait_for(&mut a.events, connected).await;
        wait_for(&mut b.events, connected).await;
        (store, a, b)
    }

    #[tokio::test(start_paused = true)]
    async fn host_offers_and_both_connect() {
        let (_store, a, b) = connect_pair().await;

        let host_conns = a.factory.connections();
        let guest_conns = b.factory.connections();
        assert_eq!(host_conns.len(), 1);
        assert_eq!(guest_conns.len(), 1);
        assert!(host_conns[0].offered());
        assert!(!guest_conns[0].offered());
        assert!(host_conns[0].has_local_track());

        // Host candidates reached the guest connection
        assert!(!guest_conns[0].remote_candidates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connections_are_rebuilt_with_a_new_session() {
        let (_store, mut a, mut b) = connect_pair().await;

        a.factory.connections()[0].fail();
        b.factory.connections()[0].fail();

        wait_for(&mut a.events, connected).await;
        wait_for(&mut b.events, connected).await;

        let host_conns = a.factory.connections();
        assert_eq!(host_conns.len(), 2);
        assert!(host_conns[0].is_closed());
        assert_eq!(
            host_conns[1].connection_state(),
            PeerConnectionState::Connected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_peer_is_removed() {
        let (_store, mut a, _b) = connect_pair().await;

        a.commands
            .send(OrchestratorCommand::Presence(vec![Seat::Role(Role::Host)]))
            .await
            .unwrap();
        let event = wait_for(&mut a.events, |e| {
            matches!(e, OrchestratorEvent::PeerRemoved(_))
        })
        .await;
        assert_eq!(event, OrchestratorEvent::PeerRemoved(Seat::Role(Role::Guest)));
        assert!(a.factory.connections()[0].is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn creation_failure_reports_busy() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(1_000);
        let mut a = spawn_client(&store, &clock, Seat::Role(Role::Host));
        a.factory.fail_next_create();

        a.commands
            .send(OrchestratorCommand::Presence(vec![Seat::Role(Role::Guest)]))
            .await
            .unwrap();
        let event = wait_for(&mut a.events, |e| matches!(e, OrchestratorEvent::Busy(_))).await;
        assert_eq!(event, OrchestratorEvent::Busy(CONNECTION_FAILED.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_connections() {
        let (_store, a, _b) = connect_pair().await;
        a.commands.send(OrchestratorCommand::Shutdown).await.unwrap();
        a.handle.await.unwrap().unwrap();
        assert!(a.factory.connections().iter().all(|c| c.is_closed()));
    }

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.2 {} typ host", n, 40000 + n),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_before_the_offer_are_buffered() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(1_000);
        let host = Seat::Role(Role::Host);
        let guest = Seat::Role(Role::Guest);
        let remote = exchange(&store, &clock, host.clone(), Topology::TwoParty);
        let mut b = spawn_client(&store, &clock, guest.clone());
        b.commands
            .send(OrchestratorCommand::Presence(vec![host.clone()]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // More candidates than the buffer holds, all ahead of the offer
        let session = SessionId::new();
        for n in 0..MAX_EARLY_CANDIDATES + 6 {
            remote
                .publish_candidate(&guest, &session, &candidate(n))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(b.factory.connections().is_empty());

        remote
            .publish_description(&guest, &session, &SessionDescription::offer("v=0 late offer"))
            .await
            .unwrap();
        wait_for(&mut b.events, connected).await;

        let conns = b.factory.connections();
        assert_eq!(conns.len(), 1);
        let flushed = conns[0].remote_candidates();
        assert_eq!(flushed.len(), MAX_EARLY_CANDIDATES);
        // The oldest ones were dropped
        assert_eq!(flushed[0], candidate(6));
        assert_eq!(flushed[MAX_EARLY_CANDIDATES - 1], candidate(MAX_EARLY_CANDIDATES + 5));
    }

    #[tokio::test(start_paused = true)]
    async fn offer_during_a_connected_session_waits_for_teardown() {
        let (store, _a, mut b) = connect_pair().await;
        let clock = ManualClock::new(5_000);
        let host = Seat::Role(Role::Host);
        let guest = Seat::Role(Role::Guest);
        let remote = exchange(&store, &clock, host, Topology::TwoParty);

        let session = SessionId::new();
        remote
            .publish_description(&guest, &session, &SessionDescription::offer("v=0 second offer"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        // The healthy session is left alone
        let conns = b.factory.connections();
        assert_eq!(conns.len(), 1);
        assert!(!conns[0].is_closed());

        conns[0].fail();
        wait_for(&mut b.events, connected).await;

        let conns = b.factory.connections();
        assert_eq!(conns.len(), 2);
        assert!(conns[0].is_closed());
        assert_eq!(
            conns[1].remote_description().map(|d| d.sdp),
            Some("v=0 second offer".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mesh_clients_connect_to_everyone() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(1_000);
        let seats: Vec<Seat> = ["client-aaaa", "client-bbbb", "client-cccc"]
            .iter()
            .map(|id| Seat::Client(ClientId::parse(id).unwrap()))
            .collect();
        let mut clients: Vec<Client> = seats
            .iter()
            .map(|seat| spawn_in(&store, &clock, seat.clone(), Topology::Mesh))
            .collect();

        for client in &clients {
            client
                .commands
                .send(OrchestratorCommand::Presence(seats.clone()))
                .await
                .unwrap();
        }

        for (index, client) in clients.iter_mut().enumerate() {
            let mut peers = BTreeSet::new();
            while peers.len() < 2 {
                if let OrchestratorEvent::PeerState { peer, .. } =
                    wait_for(&mut client.events, connected).await
                {
                    peers.insert(peer);
                }
            }
            let expected: BTreeSet<Seat> = seats
                .iter()
                .filter(|seat| **seat != seats[index])
                .cloned()
                .collect();
            assert_eq!(peers, expected);
        }

        // The lower id offers on every pair
        let offered: Vec<usize> = clients
            .iter()
            .map(|c| c.factory.connections().iter().filter(|pc| pc.offered()).count())
            .collect();
        assert_eq!(offered, vec![2, 1, 0]);
        assert!(clients
            .iter()
            .all(|c| c.factory.connections().len() == 2));
    }
}
