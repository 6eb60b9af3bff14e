//! Peer connection abstraction
//!
//! The orchestrator only ever talks to these traits. `webrtc_if` provides
//! the webrtc-rs backed implementation.

use async_trait::async_trait;
use room_core::{Error, PeerConnectionState, Seat};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::webrtc_audio::LocalAudioTrack;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the shape browsers serialize with `toJSON()`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Callbacks of one peer connection, delivered as messages.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack { track_id: String },
    StateChanged(PeerConnectionState),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_track(&self, track: &LocalAudioTrack) -> Result<(), Error>;

    async fn create_offer(&self) -> Result<SessionDescription, Error>;

    async fn create_answer(&self) -> Result<SessionDescription, Error>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), Error>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error>;

    fn connection_state(&self) -> PeerConnectionState;

    async fn close(&self) -> Result<(), Error>;
}

/// Builds peer connections whose callbacks are forwarded into `events`.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        peer: &Seat,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMid"], json!("0"));
        assert_eq!(value["sdpMLineIndex"], json!(0));

        let parsed: IceCandidate =
            serde_json::from_value(json!({"candidate": "candidate:2"})).unwrap();
        assert_eq!(parsed.sdp_mid, None);
    }

    #[test]
    fn description_type_tag() {
        let value = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(value, json!({"type": "answer", "sdp": "v=0"}));
    }
}
