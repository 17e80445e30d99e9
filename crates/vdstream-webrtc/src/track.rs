//! Local tracks backed by `TrackLocalStaticSample`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, trace};
use uuid::Uuid;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use vdstream_core::{CaptureConstraints, LocalTrack, MediaDevices, MediaKind, StreamError};

use crate::error::RtcError;

const STREAM_ID: &str = "vdstream";

/// One 20 ms Opus frame of silence.
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];
const OPUS_FRAME: Duration = Duration::from_millis(20);

pub fn audio_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

pub fn video_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP8".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Outbound track fed with encoded samples.
pub struct SampleTrack {
    id: String,
    kind: MediaKind,
    placeholder: bool,
    track: Arc<TrackLocalStaticSample>,
    running: watch::Sender<bool>,
}

impl SampleTrack {
    pub fn new(kind: MediaKind, placeholder: bool) -> Self {
        let prefix = if placeholder { "placeholder" } else { "capture" };
        let id = format!("{prefix}-{kind}-{}", Uuid::new_v4());
        let capability = match kind {
            MediaKind::Audio => audio_codec_capability(),
            MediaKind::Video => video_codec_capability(),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            STREAM_ID.to_string(),
        ));
        let (running, _) = watch::channel(true);
        Self {
            id,
            kind,
            placeholder,
            track,
            running,
        }
    }

    /// Placeholder microphone: Opus silence every 20 ms until stopped.
    pub fn silent_audio() -> Arc<Self> {
        let track = Arc::new(Self::new(MediaKind::Audio, true));
        let rtc = track.rtc_track();
        let mut running = track.running.subscribe();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(OPUS_FRAME);
            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        let sample = Sample {
                            data: Bytes::from_static(&OPUS_SILENCE),
                            duration: OPUS_FRAME,
                            ..Default::default()
                        };
                        if let Err(e) = rtc.write_sample(&sample).await {
                            trace!("silence write failed: {}", e);
                        }
                    }
                    changed = running.changed() => {
                        if changed.is_err() || !*running.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("silence feeder stopped");
        });
        track
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Subscribe to the running flag; flips to `false` on [`LocalTrack::stop`].
    pub fn running(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    /// Write one encoded frame.
    pub async fn write(&self, data: Bytes, duration: Duration) -> Result<(), RtcError> {
        if !self.is_running() {
            return Err(RtcError::TrackStopped(self.id.clone()));
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.track.write_sample(&sample).await?;
        Ok(())
    }
}

impl fmt::Debug for SampleTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("placeholder", &self.placeholder)
            .field("running", &self.is_running())
            .finish()
    }
}

impl LocalTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    fn stop(&self) {
        if self.running.send_replace(false) {
            debug!("track {} stopped", self.id);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Platform capture source.
///
/// `open` starts feeding `track` (via [`SampleTrack::write`]) and returns
/// once the device is live. Feeding must end when the track's running flag
/// drops.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open(
        &self,
        track: Arc<SampleTrack>,
        constraints: &CaptureConstraints,
    ) -> Result<(), RtcError>;
}

/// [`MediaDevices`] producing [`SampleTrack`]s.
///
/// Without a backend for a kind, capture requests fail with a device error
/// and the placeholder keeps playing.
#[derive(Default, Clone)]
pub struct RtcMediaDevices {
    camera: Option<Arc<dyn CaptureBackend>>,
    microphone: Option<Arc<dyn CaptureBackend>>,
}

impl RtcMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(mut self, backend: Arc<dyn CaptureBackend>) -> Self {
        self.camera = Some(backend);
        self
    }

    pub fn with_microphone(mut self, backend: Arc<dyn CaptureBackend>) -> Self {
        self.microphone = Some(backend);
        self
    }

    fn backend(&self, kind: MediaKind) -> Option<&Arc<dyn CaptureBackend>> {
        match kind {
            MediaKind::Audio => self.microphone.as_ref(),
            MediaKind::Video => self.camera.as_ref(),
        }
    }
}

#[async_trait]
impl MediaDevices for RtcMediaDevices {
    fn placeholder(&self, kind: MediaKind) -> Result<Arc<dyn LocalTrack>, StreamError> {
        let track: Arc<dyn LocalTrack> = match kind {
            MediaKind::Audio => SampleTrack::silent_audio(),
            // Inert until a real capture replaces it.
            MediaKind::Video => Arc::new(SampleTrack::new(MediaKind::Video, true)),
        };
        Ok(track)
    }

    async fn capture(
        &self,
        kind: MediaKind,
        constraints: &CaptureConstraints,
    ) -> Result<Arc<dyn LocalTrack>, StreamError> {
        let backend = self
            .backend(kind)
            .ok_or_else(|| RtcError::NoBackend(kind.to_string()))?;
        let track = Arc::new(SampleTrack::new(kind, false));
        if let Err(e) = backend.open(track.clone(), constraints).await {
            track.stop();
            return Err(e.into());
        }
        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingBackend {
        opened: Mutex<Vec<CaptureConstraints>>,
        fail: bool,
    }

    #[async_trait]
    impl CaptureBackend for RecordingBackend {
        async fn open(
            &self,
            _track: Arc<SampleTrack>,
            constraints: &CaptureConstraints,
        ) -> Result<(), RtcError> {
            self.opened.lock().unwrap().push(constraints.clone());
            if self.fail {
                Err(RtcError::Capture("camera busy".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn placeholders_are_flagged() {
        let devices = RtcMediaDevices::new();
        let audio = devices.placeholder(MediaKind::Audio).unwrap();
        let video = devices.placeholder(MediaKind::Video).unwrap();
        assert!(audio.is_placeholder());
        assert!(video.is_placeholder());
        assert_eq!(audio.kind(), MediaKind::Audio);
        assert!(video.id().starts_with("placeholder-video-"));
        audio.stop();
    }

    #[tokio::test]
    async fn capture_without_backend_is_device_error() {
        let devices = RtcMediaDevices::new();
        let err = devices
            .capture(MediaKind::Video, &CaptureConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::DeviceAccess(_)));
    }

    #[tokio::test]
    async fn capture_passes_constraints_to_backend() {
        let backend = Arc::new(RecordingBackend {
            opened: Mutex::new(Vec::new()),
            fail: false,
        });
        let devices = RtcMediaDevices::new().with_camera(backend.clone());
        let constraints = CaptureConstraints {
            width: Some(1280),
            height: Some(720),
            ..Default::default()
        };

        let track = devices.capture(MediaKind::Video, &constraints).await.unwrap();
        assert!(!track.is_placeholder());
        assert!(track.as_any().downcast_ref::<SampleTrack>().is_some());
        assert_eq!(backend.opened.lock().unwrap()[0], constraints);
    }

    #[tokio::test]
    async fn failed_backend_reports_device_error() {
        let backend = Arc::new(RecordingBackend {
            opened: Mutex::new(Vec::new()),
            fail: true,
        });
        let devices = RtcMediaDevices::new().with_microphone(backend);
        let err = devices
            .capture(MediaKind::Audio, &CaptureConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(err, StreamError::DeviceAccess("capture failed: camera busy".into()));
    }

    #[tokio::test]
    async fn write_after_stop_fails() {
        let track = SampleTrack::new(MediaKind::Video, false);
        let mut running = track.running();
        track.stop();
        track.stop();
        assert!(running.has_changed().unwrap());
        assert!(!*running.borrow_and_update());
        let err = track
            .write(Bytes::from_static(&[0]), Duration::from_millis(33))
            .await
            .unwrap_err();
        assert!(matches!(err, RtcError::TrackStopped(_)));
    }
}
