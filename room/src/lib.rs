//! Room membership, push to talk and the per client controller
//!
//! `presence` and `ptt` are thin, transactional views over the shared
//! store. `handler` ties them to the peer orchestrator and the UI.

use network::{AudioSource, PeerConnectionFactory};
use room_core::{RoomCode, SharedClock, Timings, Topology};
use std::sync::Arc;
use store::SharedStore;

pub mod handler;
pub mod presence;
pub mod ptt;

pub use handler::RoomHandler;
pub use presence::{JoinOutcome, ParticipantRecord, PresenceAdapter, PresenceView, RoomRecord};
pub use ptt::{PttLock, PttState};

/// What a client needs to know about the room it joins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomConfig {
    pub code: RoomCode,
    pub topology: Topology,
    pub max_participants: usize,
    pub timings: Timings,
}

impl RoomConfig {
    /// Room with the default capacity and timings for `topology`
    pub fn new(code: RoomCode, topology: Topology) -> Self {
        Self {
            code,
            topology,
            max_participants: topology.default_max_participants(),
            timings: Timings::default(),
        }
    }
}

/// External collaborators of a room handler
#[derive(Clone)]
pub struct RoomServices {
    pub store: SharedStore,
    pub clock: SharedClock,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub audio: Arc<dyn AudioSource>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capacity_follows_topology() {
        let code = RoomCode::parse("4821").unwrap();
        assert_eq!(RoomConfig::new(code.clone(), Topology::TwoParty).max_participants, 2);
        assert_eq!(RoomConfig::new(code, Topology::Mesh).max_participants, 4);
    }
}
