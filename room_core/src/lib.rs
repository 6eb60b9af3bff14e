//! Shared types for talky
//!
//! Identifiers, timing constants and the error type used by every
//! other crate in the workspace.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod clock;
pub mod events;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use events::{CallStatus, JoinRejection, PeerConnectionState, RoomCommand, RoomEvent};

/// Heartbeat period for presence records.
pub const HEARTBEAT_MS: u64 = 5_000;
/// A liveness timestamp older than this is treated as gone.
pub const STALE_MS: u64 = 15_000;
/// Validity window of a PTT lock claim.
pub const PTT_LEASE_MS: u64 = 3_000;
/// Refresh period for a held PTT lock.
pub const PTT_REFRESH_MS: u64 = 1_000;
/// Delay between seeing a remote peer and sending it an offer.
pub const OFFER_DEBOUNCE_MS: u64 = 350;
/// How long a transient "busy" message stays visible.
pub const BUSY_MESSAGE_MS: u64 = 1_500;

/// Number of digits in a room pin.
pub const PIN_LENGTH: usize = 4;
/// Capacity of a two-party room.
pub const TWO_PARTY_MAX_PARTICIPANTS: usize = 2;
/// Capacity of a mesh room.
pub const MESH_MAX_PARTICIPANTS: usize = 4;

/// Fixed role in a two-party room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Guest => "guest",
        }
    }

    pub fn other(&self) -> Role {
        match self {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locally persisted random identifier of one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Minimum length of a stored identifier that is still accepted.
    pub const MIN_LEN: usize = 7;

    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept a previously stored identifier, rejecting empty or truncated ones.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.len() < Self::MIN_LEN || raw == "none" || raw == "host" || raw == "guest" {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The place a client occupies in a room: a fixed role in a two-party
/// room, or its own client id in a mesh room.
///
/// Ordering decides who offers: the lower seat always initiates, so the
/// host offers in a two-party room and the lexically smaller id offers in
/// a mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Seat {
    Role(Role),
    Client(ClientId),
}

impl Seat {
    /// Key used for this seat in store records.
    pub fn key(&self) -> &str {
        match self {
            Seat::Role(role) => role.as_str(),
            Seat::Client(id) => id.as_str(),
        }
    }

    /// Parse a stored key. `"none"` and empty strings mean no seat.
    pub fn from_key(key: &str) -> Option<Seat> {
        match key {
            "" | "none" => None,
            "host" => Some(Seat::Role(Role::Host)),
            "guest" => Some(Seat::Role(Role::Guest)),
            other => ClientId::parse(other).map(Seat::Client),
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            Seat::Role(role) => Some(*role),
            Seat::Client(_) => None,
        }
    }

    /// Whether this seat sends the offer when negotiating with `other`.
    pub fn offers_to(&self, other: &Seat) -> bool {
        self < other
    }
}

impl fmt::Display for Seat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seat::Role(role) => write!(f, "{}", role),
            // First 8 characters are enough to tell clients apart in logs
            Seat::Client(id) => write!(f, "{}", id.as_str().chars().take(8).collect::<String>()),
        }
    }
}

/// Disambiguates one offer/answer negotiation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.chars().take(8).collect::<String>())
    }
}

/// Room layout: two fixed roles, or a mesh of keyed participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    #[default]
    TwoParty,
    Mesh,
}

impl Topology {
    pub fn default_max_participants(&self) -> usize {
        match self {
            Topology::TwoParty => TWO_PARTY_MAX_PARTICIPANTS,
            Topology::Mesh => MESH_MAX_PARTICIPANTS,
        }
    }
}

/// Shared code identifying a room: a 4 digit pin or an opaque token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Validate user input as a room code.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let code = input.trim();
        if code.len() == PIN_LENGTH && code.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Self(code.to_string()));
        }
        let is_token_char = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
        if (8..=64).contains(&code.len()) && code.chars().all(is_token_char) {
            return Ok(Self(code.to_string()));
        }
        Err(Error::Validation(format!("Invalid room code: {:?}", code)))
    }

    /// Random 4 digit pin, zero padded.
    pub fn generate_pin() -> Self {
        let pin: u32 = rand::thread_rng().gen_range(0..10_000);
        Self(format!("{:0width$}", pin, width = PIN_LENGTH))
    }

    /// Random high entropy token for mesh rooms.
    pub fn generate_token() -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(20)
            .map(char::from)
            .collect();
        Self(token)
    }

    /// Keep only digits of typed input, truncated to the pin length.
    pub fn normalize_pin_input(input: &str) -> String {
        input
            .chars()
            .filter(|c| c.is_ascii_digit())
            .take(PIN_LENGTH)
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shareable link for this room.
    pub fn share_link(&self, base_url: &str) -> String {
        format!("{}/r/{}", base_url.trim_end_matches('/'), self.0)
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Timing parameters of the coordination layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub heartbeat: Duration,
    pub stale_ms: u64,
    pub ptt_lease_ms: u64,
    pub ptt_refresh: Duration,
    pub offer_debounce: Duration,
    pub busy_message: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_millis(HEARTBEAT_MS),
            stale_ms: STALE_MS,
            ptt_lease_ms: PTT_LEASE_MS,
            ptt_refresh: Duration::from_millis(PTT_REFRESH_MS),
            offer_debounce: Duration::from_millis(OFFER_DEBOUNCE_MS),
            busy_message: Duration::from_millis(BUSY_MESSAGE_MS),
        }
    }
}

/// A liveness timestamp counts while it is no older than `stale_ms`.
pub fn is_live(last_seen: u64, now: u64, stale_ms: u64) -> bool {
    now.saturating_sub(last_seen) <= stale_ms
}

/// Unified error type for the application.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Room logic error: {0}")]
    Room(String),

    #[error("Microphone unavailable: {0}")]
    Microphone(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_code_accepts_pins_and_tokens() {
        assert_eq!(RoomCode::parse("4821").unwrap().as_str(), "4821");
        assert_eq!(RoomCode::parse(" 0007 ").unwrap().as_str(), "0007");
        assert!(RoomCode::parse("Xk3_9a-Bq21").is_ok());

        assert!(matches!(RoomCode::parse("482"), Err(Error::Validation(_))));
        assert!(matches!(RoomCode::parse("48a1"), Err(Error::Validation(_))));
        assert!(matches!(RoomCode::parse("bad code!"), Err(Error::Validation(_))));
        assert!(RoomCode::parse("").is_err());
    }

    #[test]
    fn generated_codes_are_valid() {
        for _ in 0..50 {
            let pin = RoomCode::generate_pin();
            assert_eq!(pin.as_str().len(), PIN_LENGTH);
            assert!(RoomCode::parse(pin.as_str()).is_ok());
        }
        let token = RoomCode::generate_token();
        assert!(RoomCode::parse(token.as_str()).is_ok());
    }

    #[test]
    fn pin_input_normalization() {
        assert_eq!(RoomCode::normalize_pin_input("48-21x9"), "4821");
        assert_eq!(RoomCode::normalize_pin_input("ab"), "");
    }

    #[test]
    fn share_link_format() {
        let code = RoomCode::parse("4821").unwrap();
        assert_eq!(code.share_link("https://talky.app/"), "https://talky.app/r/4821");
    }

    #[test]
    fn seat_keys_round_trip() {
        let client = ClientId::new();
        for seat in [
            Seat::Role(Role::Host),
            Seat::Role(Role::Guest),
            Seat::Client(client.clone()),
        ] {
            assert_eq!(Seat::from_key(seat.key()), Some(seat.clone()));
        }
        assert_eq!(Seat::from_key("none"), None);
        assert_eq!(Seat::from_key(""), None);
        assert_eq!(Seat::from_key("abc"), None);
    }

    #[test]
    fn lower_seat_offers() {
        let host = Seat::Role(Role::Host);
        let guest = Seat::Role(Role::Guest);
        assert!(host.offers_to(&guest));
        assert!(!guest.offers_to(&host));

        let a = Seat::Client(ClientId::parse("aaaaaaaa-1").unwrap());
        let b = Seat::Client(ClientId::parse("bbbbbbbb-1").unwrap());
        assert!(a.offers_to(&b));
        assert!(!b.offers_to(&a));
    }

    #[test]
    fn client_id_parse_rejects_short_values() {
        assert!(ClientId::parse("abc").is_none());
        assert!(ClientId::parse("none").is_none());
        assert!(ClientId::parse("abcdefg").is_some());
    }

    #[test]
    fn liveness_window() {
        assert!(is_live(1_000, 16_000, STALE_MS));
        assert!(!is_live(1_000, 16_001, STALE_MS));
        // Timestamps from a clock slightly ahead still count
        assert!(is_live(2_000, 1_000, STALE_MS));
    }

    #[test]
    fn error_display() {
        let io_err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        assert!(format!("{}", io_err).contains("I/O error: file not found"));

        let anyhow_err = Error::Other(anyhow::anyhow!("Something went wrong"));
        assert!(format!("{}", anyhow_err).contains("Something went wrong"));
    }
}
