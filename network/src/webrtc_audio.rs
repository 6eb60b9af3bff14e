//! Local audio track handling
//!
//! The local track exists for the whole time a client is in a room. Push to
//! talk only flips its enabled flag; frames written while disabled are
//! dropped before they reach the peer connections.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use room_core::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Opus sample rate
pub const SAMPLE_RATE: u32 = 48_000;
/// Duration of one Opus frame
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
/// Opus encoding of a 20 ms silent frame
const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Shared handle to the local microphone track.
#[derive(Clone)]
pub struct LocalAudioTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl LocalAudioTrack {
    /// Create a disabled Opus track.
    pub fn new(stream_id: &str) -> Self {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: SAMPLE_RATE,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            stream_id.to_owned(),
        );
        Self {
            track: Arc::new(track),
            enabled: Arc::new(AtomicBool::new(false)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            debug!("Local audio track {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// False once the capture side stopped.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Stop the track for good. It stays attached but never sends again.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        if self.live.swap(false, Ordering::SeqCst) {
            info!("Local audio track stopped");
        }
    }

    /// Write one encoded frame. Returns whether it was sent.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, Error> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(false);
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Network(format!("Failed to write audio sample: {}", e)))?;
        Ok(true)
    }

    /// The webrtc-rs track to attach to peer connections.
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }
}

/// Microphone acquisition.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Open the capture device and return its (disabled) track.
    async fn open(&self) -> Result<LocalAudioTrack, Error>;
}

/// Source that produces Opus silence at the normal frame rate. Used when no
/// capture device is wired in, so the transmit path can still be exercised.
#[derive(Debug, Clone, Default)]
pub struct SilentSource {
    stream_id: String,
}

impl SilentSource {
    pub fn new(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
        }
    }
}

#[async_trait]
impl AudioSource for SilentSource {
    async fn open(&self) -> Result<LocalAudioTrack, Error> {
        let stream_id = if self.stream_id.is_empty() {
            "talky"
        } else {
            self.stream_id.as_str()
        };
        let track = LocalAudioTrack::new(stream_id);

        let pump = track.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_DURATION);
            while pump.is_live() {
                ticker.tick().await;
                match pump
                    .write_sample(Bytes::from_static(&OPUS_SILENCE_FRAME), FRAME_DURATION)
                    .await
                {
                    Ok(true) => trace!("Sent silent frame"),
                    Ok(false) => {}
                    Err(e) => warn!("Silent source write failed: {}", e),
                }
            }
            debug!("Silent source pump ended");
        });

        Ok(track)
    }
}
