use crate::presence::{JoinOutcome, PresenceAdapter, PresenceView};
use crate::ptt::{PttLock, PttState};
use crate::{RoomConfig, RoomServices};
use log::{debug, error, info, warn};
use network::{LocalAudioTrack, Orchestrator, OrchestratorCommand, OrchestratorEvent, SignalingExchange};
use room_core::{
    CallStatus, ClientId, Error, JoinRejection, PeerConnectionState, RoomCommand, RoomEvent, Seat,
};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Shown when the lock is held by someone else.
pub const CHANNEL_BUSY: &str = "Channel busy";
/// Shown when the capture track cannot be opened or has stopped.
pub const MICROPHONE_UNAVAILABLE: &str = "Microphone unavailable";
/// Shown when the store refuses our subscriptions.
pub const ROOM_UNAVAILABLE: &str = "Room unavailable";

const ORCHESTRATOR_QUEUE: usize = 32;

/// Controller of one client in one room, coordinating the UI, the shared
/// store and the peer orchestrator
pub struct RoomHandler {
    config: RoomConfig,
    client_id: ClientId,
    services: RoomServices,
    presence: PresenceAdapter,
    ptt: PttLock,
    /// Channel for receiving room commands from the UI
    command_rx: mpsc::Receiver<RoomCommand>,
    /// Channel for sending room events to the UI
    event_tx: mpsc::Sender<RoomEvent>,
    orchestrator_tx: Option<mpsc::Sender<OrchestratorCommand>>,

    seat: Option<Seat>,
    track: Option<LocalAudioTrack>,
    status: Option<CallStatus>,
    presence_view: Option<PresenceView>,
    active: Vec<Seat>,
    peer_states: HashMap<Seat, PeerConnectionState>,
    ptt_state: PttState,
    pressing: bool,
    transmitting: bool,
    /// Set once the store echoed our own claim back. Lock states delivered
    /// before that predate the claim.
    lock_confirmed: bool,
    busy_until: Option<Instant>,
}

impl RoomHandler {
    pub fn new(
        config: RoomConfig,
        client_id: ClientId,
        services: RoomServices,
        command_rx: mpsc::Receiver<RoomCommand>,
        event_tx: mpsc::Sender<RoomEvent>,
    ) -> Self {
        let presence = PresenceAdapter::new(
            services.store.clone(),
            services.clock.clone(),
            config.code.clone(),
            config.topology,
            config.max_participants,
            config.timings.stale_ms,
        );
        let ptt = PttLock::new(
            services.store.clone(),
            services.clock.clone(),
            &config.code,
            config.topology,
            config.timings.ptt_lease_ms,
        );
        Self {
            config,
            client_id,
            services,
            presence,
            ptt,
            command_rx,
            event_tx,
            orchestrator_tx: None,
            seat: None,
            track: None,
            status: None,
            presence_view: None,
            active: Vec::new(),
            peer_states: HashMap::new(),
            ptt_state: PttState::free(0),
            pressing: false,
            transmitting: false,
            lock_confirmed: false,
            busy_until: None,
        }
    }

    /// Join the room and process commands and events until leaving
    pub async fn run(&mut self) -> Result<(), Error> {
        self.set_status(CallStatus::Joining).await?;

        let seat = match self.presence.join(&self.client_id).await {
            JoinOutcome::Joined(seat) => seat,
            JoinOutcome::Full => {
                self.emit_event(RoomEvent::JoinRejected(JoinRejection::Full))
                    .await?;
                return self.set_status(CallStatus::Full).await;
            }
            JoinOutcome::Error(message) => {
                self.emit_event(RoomEvent::JoinRejected(JoinRejection::Error(message)))
                    .await?;
                return self.set_status(CallStatus::Error).await;
            }
        };
        self.seat = Some(seat.clone());
        self.emit_event(RoomEvent::Joined(seat.clone())).await?;

        let result = self.run_joined(&seat).await;
        self.teardown(&seat).await;
        result
    }

    async fn run_joined(&mut self, seat: &Seat) -> Result<(), Error> {
        let track = match self.services.audio.open().await {
            Ok(track) => track,
            Err(e) => {
                error!("Could not open the microphone: {}", e);
                return self.fail(MICROPHONE_UNAVAILABLE).await;
            }
        };
        track.set_enabled(false);
        self.track = Some(track.clone());

        if let Err(e) = self.ptt.ensure().await {
            warn!("Could not prepare the PTT lock: {}", e);
        }
        let watches = self
            .presence
            .subscribe()
            .and_then(|presence| Ok((presence, self.ptt.watch()?)));
        let (mut presence_watch, mut ptt_watch) = match watches {
            Ok(watches) => watches,
            Err(e) => {
                error!("Could not subscribe to room {}: {}", self.config.code, e);
                return self.fail(ROOM_UNAVAILABLE).await;
            }
        };

        let signaling = SignalingExchange::new(
            self.services.store.clone(),
            self.services.clock.clone(),
            self.config.code.clone(),
            seat.clone(),
            self.config.topology,
        );
        let (orchestrator_tx, orchestrator_rx) = mpsc::channel(ORCHESTRATOR_QUEUE);
        let (peer_event_tx, mut peer_event_rx) = mpsc::channel(ORCHESTRATOR_QUEUE);
        let mut orchestrator = Orchestrator::new(
            signaling,
            self.services.peers.clone(),
            track,
            self.config.timings.offer_debounce,
            orchestrator_rx,
            peer_event_tx,
        );
        let orchestrator_task = tokio::spawn(async move {
            if let Err(e) = orchestrator.run().await {
                error!("Orchestrator stopped with error: {}", e);
            }
        });
        self.orchestrator_tx = Some(orchestrator_tx.clone());

        if let Err(e) = self.presence.heartbeat(seat).await {
            warn!("Initial heartbeat failed: {}", e);
        }

        let timings = self.config.timings;
        let mut heartbeat = time::interval_at(Instant::now() + timings.heartbeat, timings.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lease = time::interval_at(Instant::now() + timings.ptt_refresh, timings.ptt_refresh);
        lease.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            let busy_deadline = self.busy_until.unwrap_or_else(Instant::now);
            let step = tokio::select! {
                // Process commands from the UI
                command = self.command_rx.recv() => match command {
                    Some(RoomCommand::Leave) => {
                        info!("Leaving room {}", self.config.code);
                        break Ok(());
                    }
                    Some(RoomCommand::Shutdown) | None => {
                        info!("Received shutdown, exiting handler");
                        break Ok(());
                    }
                    Some(command) => self.handle_command(command).await,
                },

                Some(view) = presence_watch.recv() => {
                    self.presence_view = Some(view);
                    self.refresh_presence().await
                }

                Some(state) = ptt_watch.recv() => self.handle_ptt_state(state).await,

                Some(event) = peer_event_rx.recv() => self.handle_orchestrator_event(event).await,

                _ = heartbeat.tick() => self.handle_heartbeat().await,

                _ = lease.tick() => self.handle_lease_tick().await,

                _ = time::sleep_until(busy_deadline), if self.busy_until.is_some() => {
                    self.busy_until = None;
                    self.emit_event(RoomEvent::Busy(None)).await
                }
            };
            if let Err(e) = step {
                error!("Room handler stopping: {}", e);
                break Err(e);
            }
        };

        // The orchestrator may be blocked on a full event queue
        drop(peer_event_rx);
        self.orchestrator_tx = None;
        let _ = orchestrator_tx.send(OrchestratorCommand::Shutdown).await;
        if let Err(e) = orchestrator_task.await {
            warn!("Orchestrator task ended abnormally: {}", e);
        }
        result
    }

    /// Release everything we hold in the room. Best effort.
    async fn teardown(&mut self, seat: &Seat) {
        self.pressing = false;
        if let Err(e) = self.stop_transmit().await {
            debug!("Could not report transmit stop: {}", e);
        }
        if let Err(e) = self.ptt.release(seat).await {
            warn!("Could not release the PTT lock: {}", e);
        }
        if let Some(track) = self.track.take() {
            track.stop();
        }
        if let Err(e) = self.presence.leave(seat).await {
            warn!("Could not leave room {}: {}", self.config.code, e);
        }
        self.seat = None;
        self.peer_states.clear();
        let _ = self.emit_event(RoomEvent::Left).await;
    }

    /// Report a terminal error for this room attempt
    async fn fail(&mut self, message: &str) -> Result<(), Error> {
        self.emit_event(RoomEvent::Error(message.to_string())).await?;
        self.set_status(CallStatus::Error).await
    }

    /// Handle a command from the UI
    async fn handle_command(&mut self, command: RoomCommand) -> Result<(), Error> {
        match command {
            RoomCommand::Press => self.press().await,
            RoomCommand::Release => self.release().await,
            RoomCommand::RequestState => {
                debug!("Sending current room state to UI");
                if let Some(status) = self.status {
                    self.emit_event(RoomEvent::StatusChanged(status)).await?;
                }
                self.emit_event(RoomEvent::ParticipantsChanged {
                    active: self.active.len(),
                    max: self.presence.max_participants(),
                })
                .await?;
                self.emit_event(RoomEvent::PttHolderChanged(self.ptt_state.holder.clone()))
                    .await?;
                self.emit_event(RoomEvent::TransmitChanged(self.transmitting))
                    .await
            }
            // Handled by the run loop
            RoomCommand::Leave | RoomCommand::Shutdown => Ok(()),
        }
    }

    async fn press(&mut self) -> Result<(), Error> {
        if self.pressing {
            debug!("Press ignored, already pressing");
            return Ok(());
        }
        let (Some(seat), Some(track)) = (self.seat.clone(), self.track.clone()) else {
            debug!("Press ignored, room not ready");
            return Ok(());
        };
        if !track.is_live() {
            return self.show_busy(MICROPHONE_UNAVAILABLE).await;
        }

        self.pressing = true;
        match self.ptt.acquire(&seat).await {
            Ok(true) => {
                self.lock_confirmed = false;
                self.transmitting = true;
                track.set_enabled(true);
                info!("{} is transmitting", seat);
                self.emit_event(RoomEvent::TransmitChanged(true)).await
            }
            Ok(false) => {
                self.pressing = false;
                self.show_busy(CHANNEL_BUSY).await
            }
            Err(e) => {
                warn!("PTT acquire failed: {}", e);
                self.pressing = false;
                self.show_busy(CHANNEL_BUSY).await
            }
        }
    }

    async fn release(&mut self) -> Result<(), Error> {
        let was_active = self.pressing || self.transmitting;
        self.pressing = false;
        self.stop_transmit().await?;
        if !was_active {
            return Ok(());
        }
        if let Some(seat) = self.seat.clone() {
            if let Err(e) = self.ptt.release(&seat).await {
                warn!("PTT release failed: {}", e);
            }
        }
        Ok(())
    }

    async fn stop_transmit(&mut self) -> Result<(), Error> {
        if let Some(track) = &self.track {
            track.set_enabled(false);
        }
        self.lock_confirmed = false;
        if !self.transmitting {
            return Ok(());
        }
        self.transmitting = false;
        info!("Stopped transmitting");
        self.emit_event(RoomEvent::TransmitChanged(false)).await
    }

    async fn handle_ptt_state(&mut self, state: PttState) -> Result<(), Error> {
        let holder_changed = self.ptt_state.holder != state.holder;
        self.ptt_state = state;

        if self.transmitting {
            let ours = self
                .seat
                .as_ref()
                .map(|seat| self.ptt_state.is_held_by(seat))
                .unwrap_or(false);
            if ours {
                self.lock_confirmed = true;
            } else if self.lock_confirmed {
                info!("PTT lock is no longer ours, stopping");
                self.pressing = false;
                self.stop_transmit().await?;
            } else {
                debug!("Ignoring PTT state older than our claim");
            }
        }

        if holder_changed {
            self.emit_event(RoomEvent::PttHolderChanged(self.ptt_state.holder.clone()))
                .await?;
        }
        Ok(())
    }

    /// Refresh our lease while transmitting and expire a stale holder view
    async fn handle_lease_tick(&mut self) -> Result<(), Error> {
        if self.transmitting {
            if let (Some(seat), Some(track)) = (self.seat.clone(), self.track.clone()) {
                if !track.is_live() {
                    warn!("Microphone track ended while transmitting");
                    self.release().await?;
                    return self.show_busy(MICROPHONE_UNAVAILABLE).await;
                }
                match self.ptt.refresh(&seat).await {
                    Ok(true) => debug!("PTT lease refreshed"),
                    Ok(false) => {
                        info!("PTT lease lost");
                        self.pressing = false;
                        self.stop_transmit().await?;
                    }
                    Err(e) => warn!("PTT refresh failed: {}", e),
                }
            }
        }

        let now = self.services.clock.now_ms();
        let current = self.ptt_state.at(now);
        if current.holder != self.ptt_state.holder {
            debug!("PTT lease expired");
            self.handle_ptt_state(current).await?;
        }
        Ok(())
    }

    async fn handle_heartbeat(&mut self) -> Result<(), Error> {
        if let Some(seat) = &self.seat {
            if let Err(e) = self.presence.heartbeat(seat).await {
                warn!("Heartbeat failed: {}", e);
            }
        }
        self.refresh_presence().await
    }

    /// Recompute who is active, tell the orchestrator and the UI
    async fn refresh_presence(&mut self) -> Result<(), Error> {
        let Some(view) = &self.presence_view else {
            return Ok(());
        };
        let now = self.services.clock.now_ms();
        let active = view.active_seats(now, self.config.timings.stale_ms);

        if let Some(tx) = &self.orchestrator_tx {
            let remote: Vec<Seat> = active
                .iter()
                .filter(|seat| Some(*seat) != self.seat.as_ref())
                .cloned()
                .collect();
            // Resent on every heartbeat, so a full queue only delays it
            if let Err(e) = tx.try_send(OrchestratorCommand::Presence(remote)) {
                debug!("Presence update not delivered: {}", e);
            }
        }

        if active != self.active {
            self.active = active;
            self.emit_event(RoomEvent::ParticipantsChanged {
                active: self.active.len(),
                max: self.presence.max_participants(),
            })
            .await?;
        }
        self.update_status().await
    }

    async fn handle_orchestrator_event(&mut self, event: OrchestratorEvent) -> Result<(), Error> {
        match event {
            OrchestratorEvent::PeerState { peer, state } => {
                debug!("Connection to {} is {}", peer, state);
                self.peer_states.insert(peer.clone(), state);
                self.emit_event(RoomEvent::PeerStateChanged { peer, state })
                    .await?;
                self.update_status().await
            }
            OrchestratorEvent::RemoteTrack { peer, track_id } => {
                info!("Receiving audio from {}", peer);
                self.emit_event(RoomEvent::RemoteTrack { peer, track_id })
                    .await
            }
            OrchestratorEvent::Busy(message) => self.show_busy(&message).await,
            OrchestratorEvent::PeerRemoved(peer) => {
                self.peer_states.remove(&peer);
                self.update_status().await
            }
        }
    }

    async fn update_status(&mut self) -> Result<(), Error> {
        let alone = !self
            .active
            .iter()
            .any(|seat| Some(seat) != self.seat.as_ref());
        let status = if alone {
            CallStatus::Waiting
        } else if self
            .peer_states
            .values()
            .any(|state| *state == PeerConnectionState::Connected)
        {
            CallStatus::Connected
        } else {
            CallStatus::Connecting
        };
        self.set_status(status).await
    }

    async fn set_status(&mut self, status: CallStatus) -> Result<(), Error> {
        if self.status == Some(status) {
            return Ok(());
        }
        self.status = Some(status);
        self.emit_event(RoomEvent::StatusChanged(status)).await
    }

    async fn show_busy(&mut self, message: &str) -> Result<(), Error> {
        self.busy_until = Some(Instant::now() + self.config.timings.busy_message);
        self.emit_event(RoomEvent::Busy(Some(message.to_string())))
            .await
    }

    /// Emit a room event to the UI
    async fn emit_event(&self, event: RoomEvent) -> Result<(), Error> {
        self.event_tx
            .send(event)
            .await
            .map_err(|e| Error::Room(format!("Failed to send room event: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use network::testing::FakePeerFactory;
    use network::AudioSource;
    use room_core::{Clock, ManualClock, Role, RoomCode, Topology};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use store::{DocumentStore, Fields, MemoryStore};
    use tokio::sync::mpsc::{Receiver, Sender};
    use tokio::task::JoinHandle;

    const START: u64 = 1_700_000_000_000;

    /// Microphone that hands out plain tracks and remembers them
    #[derive(Default)]
    struct TestMic {
        opened: Mutex<Vec<LocalAudioTrack>>,
    }

    impl TestMic {
        fn track(&self) -> LocalAudioTrack {
            self.opened.lock().unwrap()[0].clone()
        }
    }

    #[async_trait]
    impl AudioSource for TestMic {
        async fn open(&self) -> Result<LocalAudioTrack, Error> {
            let track = LocalAudioTrack::new("test");
            self.opened.lock().unwrap().push(track.clone());
            Ok(track)
        }
    }

    mockall::mock! {
        Mic {}
        #[async_trait]
        impl AudioSource for Mic {
            async fn open(&self) -> Result<LocalAudioTrack, Error>;
        }
    }

    struct Harness<M = TestMic> {
        store: MemoryStore,
        clock: ManualClock,
        mic: Arc<M>,
        command_tx: Sender<RoomCommand>,
        event_rx: Receiver<RoomEvent>,
        task: JoinHandle<Result<(), Error>>,
    }

    fn code() -> RoomCode {
        RoomCode::parse("4821").unwrap()
    }

    fn start<M: AudioSource + 'static>(store: MemoryStore, mic: M) -> Harness<M> {
        let (command_tx, command_rx) = mpsc::channel(10);
        let (event_tx, event_rx) = mpsc::channel(100);
        let mic = Arc::new(mic);
        let clock = ManualClock::new(START);
        let services = RoomServices {
            store: Arc::new(store.clone()),
            clock: Arc::new(clock.clone()),
            peers: Arc::new(FakePeerFactory::new()),
            audio: mic.clone(),
        };
        let mut handler = RoomHandler::new(
            RoomConfig::new(code(), Topology::TwoParty),
            ClientId::new(),
            services,
            command_rx,
            event_tx,
        );
        let task = tokio::spawn(async move { handler.run().await });
        Harness {
            store,
            clock,
            mic,
            command_tx,
            event_rx,
            task,
        }
    }

    async fn expect_event<F>(rx: &mut Receiver<RoomEvent>, mut wanted: F) -> RoomEvent
    where
        F: FnMut(&RoomEvent) -> bool,
    {
        let search = async {
            while let Some(event) = rx.recv().await {
                if wanted(&event) {
                    return event;
                }
            }
            panic!("event channel closed");
        };
        time::timeout(Duration::from_secs(30), search)
            .await
            .expect("timed out waiting for event")
    }

    /// Let `ms` pass on both the runtime timers and the store clock
    async fn hold_for(clock: &ManualClock, ms: u64) {
        for _ in 0..ms / 500 {
            clock.advance(500);
            time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn stored_lock(h: &Harness) -> PttState {
        let doc = h.store.get(&store::layout::ptt(&code())).await.unwrap();
        PttState::normalize(doc.data.as_ref(), h.clock.now_ms(), Topology::TwoParty)
    }

    async fn press_and_confirm(h: &mut Harness) {
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::StatusChanged(CallStatus::Waiting)).await;
        h.command_tx.send(RoomCommand::Press).await.unwrap();
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::TransmitChanged(true)).await;
        expect_event(&mut h.event_rx, |e| {
            *e == RoomEvent::PttHolderChanged(Some(Seat::Role(Role::Host)))
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_alone_waits() {
        let mut h = start(MemoryStore::new(), TestMic::default());

        expect_event(&mut h.event_rx, |e| *e == RoomEvent::StatusChanged(CallStatus::Joining)).await;
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::Joined(Seat::Role(Role::Host))).await;
        expect_event(&mut h.event_rx, |e| {
            *e == RoomEvent::ParticipantsChanged { active: 1, max: 2 }
        })
        .await;
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::StatusChanged(CallStatus::Waiting)).await;

        h.command_tx.send(RoomCommand::Shutdown).await.unwrap();
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::Left).await;
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_room_is_rejected() {
        let store = MemoryStore::new();
        let presence = PresenceAdapter::new(
            Arc::new(store.clone()),
            Arc::new(ManualClock::new(START)),
            code(),
            Topology::TwoParty,
            2,
            room_core::STALE_MS,
        );
        presence.join(&ClientId::new()).await;
        presence.join(&ClientId::new()).await;

        let mut mic = MockMic::new();
        mic.expect_open().never();
        let mut h = start(store, mic);
        expect_event(&mut h.event_rx, |e| {
            *e == RoomEvent::JoinRejected(JoinRejection::Full)
        })
        .await;
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::StatusChanged(CallStatus::Full)).await;
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_microphone_failure_leaves_the_room() {
        let mut mic = MockMic::new();
        mic.expect_open()
            .times(1)
            .returning(|| Err(Error::Microphone("permission denied".to_string())));
        let mut h = start(MemoryStore::new(), mic);

        expect_event(&mut h.event_rx, |e| {
            *e == RoomEvent::Error(MICROPHONE_UNAVAILABLE.to_string())
        })
        .await;
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::Left).await;
        h.task.await.unwrap().unwrap();

        let room = h.store.get(&store::layout::room(&code())).await.unwrap();
        let record = crate::RoomRecord::normalize(room.data.as_ref(), START);
        assert!(!record.host_joined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_and_release() {
        let mut h = start(MemoryStore::new(), TestMic::default());
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::StatusChanged(CallStatus::Waiting)).await;
        let track = h.mic.track();
        assert!(!track.is_enabled());

        h.command_tx.send(RoomCommand::Press).await.unwrap();
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::TransmitChanged(true)).await;
        expect_event(&mut h.event_rx, |e| {
            *e == RoomEvent::PttHolderChanged(Some(Seat::Role(Role::Host)))
        })
        .await;
        assert!(track.is_enabled());

        // Holding past several leases keeps the lock
        hold_for(&h.clock, 10_000).await;
        assert!(track.is_enabled());
        let lock = stored_lock(&h).await;
        assert!(lock.is_held_by(&Seat::Role(Role::Host)));
        assert!(lock.expires_at > h.clock.now_ms());

        h.command_tx.send(RoomCommand::Release).await.unwrap();
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::TransmitChanged(false)).await;
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::PttHolderChanged(None)).await;
        assert!(!track.is_enabled());

        h.command_tx.send(RoomCommand::Leave).await.unwrap();
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::Left).await;
        h.task.await.unwrap().unwrap();
        assert!(!track.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_refused_shows_busy() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(START));
        // Someone else already holds the lock
        let other = PttLock::new(
            Arc::new(store.clone()),
            clock,
            &code(),
            Topology::TwoParty,
            60_000,
        );
        other.acquire(&Seat::Role(Role::Guest)).await.unwrap();

        let mut h = start(store, TestMic::default());
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::StatusChanged(CallStatus::Waiting)).await;

        h.command_tx.send(RoomCommand::Press).await.unwrap();
        expect_event(&mut h.event_rx, |e| {
            *e == RoomEvent::Busy(Some(CHANNEL_BUSY.to_string()))
        })
        .await;
        assert!(!h.mic.track().is_enabled());
        // The message clears itself
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::Busy(None)).await;

        h.command_tx.send(RoomCommand::Shutdown).await.unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_without_press_is_harmless() {
        let mut h = start(MemoryStore::new(), TestMic::default());
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::StatusChanged(CallStatus::Waiting)).await;

        h.command_tx.send(RoomCommand::Release).await.unwrap();
        h.command_tx.send(RoomCommand::RequestState).await.unwrap();
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::TransmitChanged(false)).await;

        h.command_tx.send(RoomCommand::Shutdown).await.unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_microphone_ends_transmission() {
        let mut h = start(MemoryStore::new(), TestMic::default());
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::StatusChanged(CallStatus::Waiting)).await;

        h.command_tx.send(RoomCommand::Press).await.unwrap();
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::TransmitChanged(true)).await;

        h.mic.track().stop();
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::TransmitChanged(false)).await;
        expect_event(&mut h.event_rx, |e| {
            *e == RoomEvent::Busy(Some(MICROPHONE_UNAVAILABLE.to_string()))
        })
        .await;

        h.command_tx.send(RoomCommand::Shutdown).await.unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_lapses_when_refreshes_fail() {
        let mut h = start(MemoryStore::new(), TestMic::default());
        press_and_confirm(&mut h).await;

        // Refreshes fail from here on, so the lease runs out
        h.store.set_offline(true);
        hold_for(&h.clock, 500).await;
        assert!(h.mic.track().is_enabled());
        hold_for(&h.clock, room_core::PTT_LEASE_MS).await;
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::TransmitChanged(false)).await;
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::PttHolderChanged(None)).await;
        assert!(!h.mic.track().is_enabled());

        h.store.set_offline(false);
        h.command_tx.send(RoomCommand::Shutdown).await.unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_holder_stops_transmission() {
        let mut h = start(MemoryStore::new(), TestMic::default());
        press_and_confirm(&mut h).await;

        // Another client overwrote the lock record
        let guest = Seat::Role(Role::Guest);
        let mut fields = Fields::new();
        fields.insert("holder".to_string(), serde_json::json!("guest"));
        fields.insert("expiresAt".to_string(), serde_json::json!(START + 60_000));
        fields.insert("updatedAt".to_string(), serde_json::json!(START));
        h.store
            .set(&store::layout::ptt(&code()), fields, false)
            .await
            .unwrap();

        expect_event(&mut h.event_rx, |e| *e == RoomEvent::TransmitChanged(false)).await;
        expect_event(&mut h.event_rx, |e| *e == RoomEvent::PttHolderChanged(Some(guest.clone())))
            .await;
        assert!(!h.mic.track().is_enabled());

        // Our release must not clear the other holder
        h.command_tx.send(RoomCommand::Release).await.unwrap();
        h.command_tx.send(RoomCommand::Shutdown).await.unwrap();
        (&mut h.task).await.unwrap().unwrap();
        assert!(stored_lock(&h).await.is_held_by(&guest));
    }
}
