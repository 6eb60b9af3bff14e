use async_trait::async_trait;
use log::{debug, error, info, trace};
use room_core::{Error, PeerConnectionState, Seat};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::peer::{
    IceCandidate, PeerConnection, PeerConnectionFactory, PeerEvent, SdpType, SessionDescription,
};
use crate::webrtc_audio::LocalAudioTrack;

/// Builds webrtc-rs peer connections for audio only rooms
pub struct WebRtcPeerFactory {
    /// WebRTC API instance
    api: API,
    /// Default RTCConfiguration used for all peer connections
    rtc_config: RTCConfiguration,
}

impl WebRtcPeerFactory {
    /// Create a factory using the given STUN/TURN urls
    pub fn new(ice_servers: &[String]) -> Result<Self, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::Network(format!("Failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::Network(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        Ok(Self { api, rtc_config })
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        peer: &Seat,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, Error> {
        debug!("Creating new peer connection for peer {}", peer);
        let pc = self
            .api
            .new_peer_connection(self.rtc_config.clone())
            .await
            .map_err(|e| Error::Network(format!("Failed to create peer connection: {}", e)))?;

        // Set up connection state change handler
        let event_sender = events.clone();
        let peer_label = peer.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let event_sender = event_sender.clone();
            let peer_label = peer_label.clone();
            Box::pin(async move {
                debug!("Peer connection state change for {}: {}", peer_label, state);
                let _ = event_sender
                    .send(PeerEvent::StateChanged(map_state(state)))
                    .await;
            })
        }));

        // Set up ICE candidate handler
        let event_sender = events.clone();
        let peer_label = peer.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let event_sender = event_sender.clone();
            let peer_label = peer_label.clone();
            Box::pin(async move {
                // `None` marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        trace!("Local ICE candidate for peer {}: {}", peer_label, init.candidate);
                        let _ = event_sender
                            .send(PeerEvent::LocalCandidate(from_rtc_candidate(init)))
                            .await;
                    }
                    Err(e) => error!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        setup_track_handler(&pc, events, peer.to_string());

        Ok(Arc::new(WebRtcPeer {
            pc: Arc::new(pc),
            peer: peer.clone(),
        }))
    }
}

/// One webrtc-rs peer connection
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    peer: Seat,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_track(&self, track: &LocalAudioTrack) -> Result<(), Error> {
        debug!("Adding track to peer connection for peer {}", self.peer);
        let rtc_track: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
        let rtp_sender = self
            .pc
            .add_track(rtc_track)
            .await
            .map_err(|e| Error::Network(format!("Failed to add track: {}", e)))?;

        // RTCP has to be read for interceptors (NACK, reports) to work
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
            trace!("RTCP reader finished");
        });

        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Network(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Network(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), Error> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| Error::Network(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| Error::Network(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::Network(format!("Failed to add ICE candidate: {}", e)))
    }

    fn connection_state(&self) -> PeerConnectionState {
        map_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<(), Error> {
        debug!("Closing peer connection for peer {}", self.peer);
        self.pc
            .close()
            .await
            .map_err(|e| Error::Network(format!("Failed to close peer connection: {}", e)))
    }
}

fn map_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, Error> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| Error::Network(format!("Failed to parse session description: {}", e)))
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

/// Set up track handler on a peer connection
fn setup_track_handler(pc: &RTCPeerConnection, events: mpsc::Sender<PeerEvent>, peer_label: String) {
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let events = events.clone();
        let peer_label = peer_label.clone();
        Box::pin(async move {
            let track_id = track.id();
            debug!(
                "Track received for peer {}: id={}, kind={}",
                peer_label,
                track_id,
                track.kind()
            );

            let _ = events.send(PeerEvent::RemoteTrack { track_id }).await;

            // Playback is outside this crate; keep the receive buffers drained
            tokio::spawn(async move {
                let mut packets: u64 = 0;
                while track.read_rtp().await.is_ok() {
                    packets += 1;
                }
                info!(
                    "Audio track for peer {} ended after {} packets",
                    peer_label, packets
                );
            });
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_factory() {
        let stun_servers = vec!["stun:stun.l.google.com:19302".to_string()];
        let factory = WebRtcPeerFactory::new(&stun_servers).unwrap();

        assert_eq!(factory.rtc_config.ice_servers.len(), 1);
        assert_eq!(
            factory.rtc_config.ice_servers[0].urls[0],
            "stun:stun.l.google.com:19302"
        );
    }

    #[tokio::test]
    async fn test_offer_has_audio_section() {
        let factory = WebRtcPeerFactory::new(&[]).unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let pc = factory
            .create(&Seat::Role(room_core::Role::Host), tx)
            .await
            .unwrap();
        pc.add_local_track(&LocalAudioTrack::new("test"))
            .await
            .unwrap();

        let offer = pc.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.to_lowercase().contains("opus"));

        pc.close().await.unwrap();
        assert_eq!(pc.connection_state(), PeerConnectionState::Closed);
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Unspecified),
            PeerConnectionState::New
        );
        assert!(map_state(RTCPeerConnectionState::Failed).is_terminal());
    }
}
