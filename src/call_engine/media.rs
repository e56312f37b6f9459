//! Lokale und entfernte Media-Tracks
//!
//! Die Media-Quelle liefert die lokalen Audio-/Video-Tracks einer Session.
//! Das Encoding der Samples gehört nicht hierher; die Tracks werden nur
//! verdrahtet und beim Auflegen gestoppt.

use crate::config::MediaConfig;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Sample Rate für Opus (48kHz)
pub const AUDIO_CLOCK_RATE: u32 = 48000;

/// RTP Clock Rate für Video
pub const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("Camera/microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("No camera or microphone available")]
    NoDevices,

    #[error("Media device unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Lokaler Track aus der Media-Quelle
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    stream_id: String,
    stopped: Arc<AtomicBool>,
    rtc: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
            stopped: Arc::new(AtomicBool::new(false)),
            rtc: None,
        }
    }

    /// Track, der von einem webrtc `TrackLocalStaticSample` getragen wird
    pub fn with_rtc(kind: TrackKind, track: Arc<TrackLocalStaticSample>) -> Self {
        use webrtc::track::track_local::TrackLocal;

        Self {
            id: track.id().to_string(),
            kind,
            stream_id: track.stream_id().to_string(),
            stopped: Arc::new(AtomicBool::new(false)),
            rtc: Some(track),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn rtc_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.rtc.clone()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Alle lokalen Tracks einer Session
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub stream_id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Track der Gegenseite
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    id: String,
    kind: TrackKind,
    stopped: Arc<AtomicBool>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Ein einziger, wachsender Remote-Stream; Tracks werden nach ID dedupliziert
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Fügt einen Track hinzu. `false` wenn die ID bereits bekannt ist.
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

// ============================================================================
// MEDIA SOURCE
// ============================================================================

/// Liefert Kamera/Mikrofon einer Session
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia, MediaAccessError>;
}

/// Media-Quelle auf Basis von webrtc Sample-Tracks (Opus + VP8)
#[derive(Debug, Clone)]
pub struct RtcMediaSource {
    config: MediaConfig,
}

impl RtcMediaSource {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MediaSource for RtcMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, MediaAccessError> {
        if !self.config.audio && !self.config.video {
            return Err(MediaAccessError::NoDevices);
        }

        let stream_id = format!("gift-call-{}", uuid::Uuid::new_v4());
        let mut tracks = Vec::new();

        if self.config.audio {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: AUDIO_CLOCK_RATE,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_string(),
                stream_id.clone(),
            ));
            tracks.push(LocalTrack::with_rtc(TrackKind::Audio, track));
        }

        if self.config.video {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    ..Default::default()
                },
                "video".to_string(),
                stream_id.clone(),
            ));
            tracks.push(LocalTrack::with_rtc(TrackKind::Video, track));
        }

        tracing::info!("Acquired {} local track(s) for stream {}", tracks.len(), stream_id);

        Ok(LocalMedia { stream_id, tracks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_stream_deduplicates_by_id() {
        let mut stream = RemoteStream::default();

        assert!(stream.add_track(RemoteTrack::new("a", TrackKind::Audio)));
        assert!(stream.add_track(RemoteTrack::new("v", TrackKind::Video)));
        assert!(!stream.add_track(RemoteTrack::new("a", TrackKind::Audio)));
        assert_eq!(stream.tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_rtc_source_without_devices_is_denied() {
        let source = RtcMediaSource::new(MediaConfig {
            audio: false,
            video: false,
        });
        assert_eq!(source.acquire().await.unwrap_err(), MediaAccessError::NoDevices);
    }

    #[tokio::test]
    async fn test_rtc_source_creates_audio_and_video() {
        let source = RtcMediaSource::new(MediaConfig::default());
        let media = source.acquire().await.unwrap();

        let kinds: Vec<_> = media.tracks.iter().map(|t| t.kind()).collect();
        assert_eq!(kinds, vec![TrackKind::Audio, TrackKind::Video]);
        assert!(media.tracks.iter().all(|t| t.stream_id() == media.stream_id));

        media.stop_all();
        assert!(media.tracks.iter().all(|t| t.is_stopped()));
    }
}
