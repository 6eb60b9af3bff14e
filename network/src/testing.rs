//! In-memory peer connections for tests
//!
//! A `FakePeerConnection` reaches `connected` as soon as both its local and
//! remote descriptions are set, and emits one local candidate per local
//! description. Remote candidates are rejected until a remote description
//! exists, like a real connection.

use async_trait::async_trait;
use room_core::{Error, PeerConnectionState, Seat};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::peer::{
    IceCandidate, PeerConnection, PeerConnectionFactory, PeerEvent, SdpType, SessionDescription,
};
use crate::webrtc_audio::LocalAudioTrack;

static NEXT_CANDIDATE: AtomicU32 = AtomicU32::new(1);

#[derive(Default)]
struct FakeState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    state: Option<PeerConnectionState>,
    track_attached: bool,
    offered: bool,
}

pub struct FakePeerConnection {
    peer: Seat,
    events: mpsc::Sender<PeerEvent>,
    inner: Mutex<FakeState>,
}

impl FakePeerConnection {
    fn new(peer: Seat, events: mpsc::Sender<PeerEvent>) -> Self {
        Self {
            peer,
            events,
            inner: Mutex::new(FakeState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn peer(&self) -> &Seat {
        &self.peer
    }

    pub fn offered(&self) -> bool {
        self.lock().offered
    }

    pub fn has_local_track(&self) -> bool {
        self.lock().track_attached
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.lock().remote_candidates.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().state == Some(PeerConnectionState::Closed)
    }

    /// Drive the connection into `failed`.
    pub fn fail(&self) {
        self.lock().state = Some(PeerConnectionState::Failed);
        let _ = self
            .events
            .try_send(PeerEvent::StateChanged(PeerConnectionState::Failed));
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Network("connection is closed".to_string()));
        }
        Ok(())
    }

    /// Events caused by a description change, computed under the lock.
    fn progress(state: &mut FakeState) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        if state.state.is_none() {
            state.state = Some(PeerConnectionState::Connecting);
            events.push(PeerEvent::StateChanged(PeerConnectionState::Connecting));
        }
        if state.local.is_some()
            && state.remote.is_some()
            && state.state == Some(PeerConnectionState::Connecting)
        {
            state.state = Some(PeerConnectionState::Connected);
            events.push(PeerEvent::StateChanged(PeerConnectionState::Connected));
        }
        events
    }

    async fn send_all(&self, events: Vec<PeerEvent>) {
        for event in events {
            let _ = self.events.send(event).await;
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn add_local_track(&self, _track: &LocalAudioTrack) -> Result<(), Error> {
        self.ensure_open()?;
        self.lock().track_attached = true;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        self.ensure_open()?;
        self.lock().offered = true;
        Ok(SessionDescription::offer(format!("v=0 fake offer to {}", self.peer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        self.ensure_open()?;
        match self.lock().remote.as_ref().map(|d| d.sdp_type) {
            Some(SdpType::Offer) => Ok(SessionDescription::answer(format!(
                "v=0 fake answer to {}",
                self.peer
            ))),
            _ => Err(Error::InvalidState("no remote offer".to_string())),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), Error> {
        self.ensure_open()?;
        let mut events = {
            let mut state = self.lock();
            state.local = Some(desc);
            Self::progress(&mut state)
        };
        let n = NEXT_CANDIDATE.fetch_add(1, Ordering::SeqCst);
        events.insert(
            events.len().min(1),
            PeerEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                    n,
                    50000 + n
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            }),
        );
        self.send_all(events).await;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error> {
        self.ensure_open()?;
        let events = {
            let mut state = self.lock();
            state.remote = Some(desc);
            Self::progress(&mut state)
        };
        self.send_all(events).await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        self.ensure_open()?;
        let mut state = self.lock();
        if state.remote.is_none() {
            return Err(Error::InvalidState("remote description not set".to_string()));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.lock().state.unwrap_or(PeerConnectionState::New)
    }

    async fn close(&self) -> Result<(), Error> {
        self.lock().state = Some(PeerConnectionState::Closed);
        Ok(())
    }
}

/// Factory that records every connection it hands out.
#[derive(Default)]
pub struct FakePeerFactory {
    created: Mutex<Vec<Arc<FakePeerConnection>>>,
    fail_next: AtomicBool,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create` call fail.
    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Arc<FakePeerConnection>> {
        match self.created.lock() {
            Ok(created) => created.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn connections_to(&self, peer: &Seat) -> Vec<Arc<FakePeerConnection>> {
        self.connections()
            .into_iter()
            .filter(|c| c.peer() == peer)
            .collect()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        peer: &Seat,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, Error> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Network("peer connection unavailable".to_string()));
        }
        let pc = Arc::new(FakePeerConnection::new(peer.clone(), events));
        if let Ok(mut created) = self.created.lock() {
            created.push(pc.clone());
        }
        Ok(pc)
    }
}
