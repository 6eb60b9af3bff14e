use crate::Seat;
use std::fmt;

/// Connection state reported by a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States after which the connection is torn down and rebuilt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected
                | PeerConnectionState::Failed
                | PeerConnectionState::Closed
        )
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Commands that the UI sends to the room handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomCommand {
    /// Talk button pressed
    Press,

    /// Talk button released
    Release,

    /// Re-emit the current status
    RequestState,

    /// Leave the room gracefully
    Leave,

    /// Stop the handler without waiting for anything else (used for testing)
    Shutdown,
}

/// Why a join attempt did not produce a seat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRejection {
    /// Every slot is held by an active participant
    Full,
    /// The store could not be reached or the transaction failed
    Error(String),
}

/// Application level status of the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Joining,
    /// Joined but alone in the room
    Waiting,
    Connecting,
    Connected,
    Full,
    Error,
}

impl CallStatus {
    pub fn label(&self) -> &'static str {
        match self {
            CallStatus::Joining => "Joining",
            CallStatus::Waiting => "Waiting",
            CallStatus::Connecting => "Connecting",
            CallStatus::Connected => "Connected",
            CallStatus::Full => "Full",
            CallStatus::Error => "Error",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Events the room handler emits to the UI
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// A seat was reserved for us
    Joined(Seat),

    /// The join attempt was refused
    JoinRejected(JoinRejection),

    /// The overall call status changed
    StatusChanged(CallStatus),

    /// Number of active participants changed
    ParticipantsChanged {
        /// Active participants, ourselves included
        active: usize,
        /// Room capacity
        max: usize,
    },

    /// A peer connection changed state
    PeerStateChanged {
        /// The remote peer
        peer: Seat,
        /// New connection state
        state: PeerConnectionState,
    },

    /// Remote audio arrived from a peer
    RemoteTrack {
        /// The remote peer
        peer: Seat,
        /// Track id reported by the connection
        track_id: String,
    },

    /// The PTT lock holder changed (`None` when the channel is free)
    PttHolderChanged(Option<Seat>),

    /// Our local track started or stopped transmitting
    TransmitChanged(bool),

    /// Transient message for the user, `None` clears it
    Busy(Option<String>),

    /// User facing error that ends the room attempt
    Error(String),

    /// We left the room and every resource was released
    Left,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(PeerConnectionState::Failed.is_terminal());
        assert!(PeerConnectionState::Disconnected.is_terminal());
        assert!(PeerConnectionState::Closed.is_terminal());
        assert!(!PeerConnectionState::Connecting.is_terminal());
        assert!(!PeerConnectionState::Connected.is_terminal());
        assert!(!PeerConnectionState::New.is_terminal());
    }

    #[test]
    fn status_labels() {
        assert_eq!(CallStatus::Waiting.to_string(), "Waiting");
        assert_eq!(CallStatus::Connected.label(), "Connected");
    }
}
