//! Peer connections and signaling for talky
//!
//! This crate owns everything between the shared store and the audio
//! transport: the peer connection abstraction and its webrtc-rs
//! implementation, the local audio track, signaling records exchanged
//! through the store, and the orchestrator that keeps one connection per
//! active remote peer.

pub mod orchestrator;
pub mod peer;
pub mod signaling;
pub mod webrtc_audio;
pub mod webrtc_if;

#[cfg(any(test, feature = "test_utils"))]
pub mod testing;

pub use orchestrator::{Orchestrator, OrchestratorCommand, OrchestratorEvent};
pub use peer::{
    IceCandidate, PeerConnection, PeerConnectionFactory, PeerEvent, SdpType, SessionDescription,
};
pub use signaling::{InboundSignal, PeerSignals, ProcessedIds, SignalPayload, SignalingExchange};
pub use webrtc_audio::{AudioSource, LocalAudioTrack, SilentSource};
pub use webrtc_if::WebRtcPeerFactory;
