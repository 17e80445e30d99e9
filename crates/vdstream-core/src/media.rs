use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::StreamError;
use crate::peer::{MediaKind, PeerConnection, SenderId};

/// A local outbound media source.
pub trait LocalTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// True for the inert tracks attached at negotiation time.
    fn is_placeholder(&self) -> bool;

    /// Release the underlying source. Idempotent.
    fn stop(&self);

    /// Lets platform adapters recover their concrete track type.
    fn as_any(&self) -> &dyn Any;
}

/// Requested capture parameters, as sent by the remote side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facing_mode: Option<String>,
}

impl CaptureConstraints {
    pub fn from_data(data: &Value) -> Result<Self, StreamError> {
        if data.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(data.clone())
            .map_err(|e| StreamError::Protocol(format!("invalid capture constraints: {e}")))
    }
}

/// Source of placeholder and real capture tracks.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Inert track: silence for audio, a single still frame for video.
    fn placeholder(&self, kind: MediaKind) -> Result<Arc<dyn LocalTrack>, StreamError>;

    /// Acquire the real device. Failures should be `StreamError::DeviceAccess`.
    async fn capture(
        &self,
        kind: MediaKind,
        constraints: &CaptureConstraints,
    ) -> Result<Arc<dyn LocalTrack>, StreamError>;
}

/// Asks the user whether the remote side may use a local device.
#[async_trait]
pub trait DevicePermission: Send + Sync {
    async fn request_camera(&self) -> bool;

    async fn request_microphone(&self) -> bool;
}

impl dyn DevicePermission {
    pub async fn request(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.request_microphone().await,
            MediaKind::Video => self.request_camera().await,
        }
    }
}

/// Grants every request.
pub struct AllowAll;

#[async_trait]
impl DevicePermission for AllowAll {
    async fn request_camera(&self) -> bool {
        true
    }

    async fn request_microphone(&self) -> bool {
        true
    }
}

/// Outbound track state for one media kind.
pub struct TrackSlot {
    placeholder: Arc<dyn LocalTrack>,
    active: Arc<dyn LocalTrack>,
    capturing: bool,
    sender: Option<SenderId>,
    /// Device permission already granted this session.
    allowed: bool,
    /// Bumped by every open/close so stale completions can be recognized.
    generation: u64,
}

impl TrackSlot {
    fn new(placeholder: Arc<dyn LocalTrack>) -> Self {
        Self {
            active: placeholder.clone(),
            placeholder,
            capturing: false,
            sender: None,
            allowed: false,
            generation: 0,
        }
    }

    pub fn active(&self) -> &Arc<dyn LocalTrack> {
        &self.active
    }

    pub fn sender(&self) -> Option<SenderId> {
        self.sender
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }
}

/// Owns the local outbound tracks of a session.
///
/// Every configured kind starts on a placeholder bound to its sender; opening a
/// device replaces the sender's track in place and closing it swaps the
/// placeholder back, so the remote side never sees a renegotiation.
#[derive(Default)]
pub struct MediaTrackManager {
    slots: HashMap<MediaKind, TrackSlot>,
}

impl MediaTrackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a placeholder for each kind that may be captured later.
    pub fn with_placeholders(
        devices: &dyn MediaDevices,
        kinds: &[MediaKind],
    ) -> Result<Self, StreamError> {
        let mut slots = HashMap::new();
        for &kind in kinds {
            let placeholder = devices.placeholder(kind)?;
            tracing::debug!("placeholder {kind} track created: {}", placeholder.id());
            slots.insert(kind, TrackSlot::new(placeholder));
        }
        Ok(Self { slots })
    }

    pub fn slot(&self, kind: MediaKind) -> Option<&TrackSlot> {
        self.slots.get(&kind)
    }

    pub fn placeholder(&self, kind: MediaKind) -> Option<Arc<dyn LocalTrack>> {
        self.slots.get(&kind).map(|s| s.placeholder.clone())
    }

    pub fn bind_sender(&mut self, kind: MediaKind, sender: SenderId) {
        if let Some(slot) = self.slots.get_mut(&kind) {
            slot.sender = Some(sender);
        }
    }

    pub fn sender(&self, kind: MediaKind) -> Option<SenderId> {
        self.slots.get(&kind).and_then(|s| s.sender)
    }

    pub fn is_allowed(&self, kind: MediaKind) -> bool {
        self.slots.get(&kind).is_some_and(|s| s.allowed)
    }

    pub fn grant(&mut self, kind: MediaKind) {
        if let Some(slot) = self.slots.get_mut(&kind) {
            slot.allowed = true;
        }
    }

    pub fn is_capturing(&self, kind: MediaKind) -> bool {
        self.slots.get(&kind).is_some_and(|s| s.capturing)
    }

    /// Start a device-open request.
    ///
    /// Returns the ticket its completion has to present, or `None` if `kind`
    /// was not configured for capture.
    pub fn begin_open(&mut self, kind: MediaKind) -> Option<u64> {
        let slot = self.slots.get_mut(&kind)?;
        slot.sender?;
        slot.generation += 1;
        Some(slot.generation)
    }

    pub fn is_current(&self, kind: MediaKind, ticket: u64) -> bool {
        self.slots.get(&kind).is_some_and(|s| s.generation == ticket)
    }

    /// Put a freshly captured track on the sender.
    ///
    /// On failure the new track is stopped and the previous one stays active.
    pub async fn swap_in(
        &mut self,
        peer: &dyn PeerConnection,
        kind: MediaKind,
        track: Arc<dyn LocalTrack>,
    ) -> Result<(), StreamError> {
        let Some(slot) = self.slots.get_mut(&kind) else {
            track.stop();
            return Err(StreamError::DeviceAccess(format!("{kind} capture not configured")));
        };
        let Some(sender) = slot.sender else {
            track.stop();
            return Err(StreamError::DeviceAccess(format!("no {kind} sender")));
        };

        if let Err(e) = peer.replace_track(sender, track.clone()).await {
            track.stop();
            return Err(StreamError::DeviceAccess(format!("replace {kind} track: {e}")));
        }

        let previous = std::mem::replace(&mut slot.active, track);
        if slot.capturing {
            previous.stop();
        }
        slot.capturing = true;
        tracing::info!("{kind} capture active on sender {sender:?}");
        Ok(())
    }

    /// Swap the placeholder back in and release the device.
    ///
    /// Also invalidates any open request still in flight. Returns `false`
    /// when nothing was being captured.
    pub async fn swap_out(
        &mut self,
        peer: &dyn PeerConnection,
        kind: MediaKind,
    ) -> Result<bool, StreamError> {
        let Some(slot) = self.slots.get_mut(&kind) else {
            return Ok(false);
        };
        slot.generation += 1;
        if !slot.capturing {
            return Ok(false);
        }

        let real = std::mem::replace(&mut slot.active, slot.placeholder.clone());
        slot.capturing = false;
        real.stop();

        if let Some(sender) = slot.sender {
            peer.replace_track(sender, slot.placeholder.clone())
                .await
                .map_err(|e| StreamError::DeviceAccess(format!("restore {kind} placeholder: {e}")))?;
        }
        tracing::info!("{kind} capture stopped");
        Ok(true)
    }

    /// Stop every track and forget all slots.
    pub fn release_all(&mut self) {
        for (kind, slot) in self.slots.drain() {
            if slot.capturing {
                slot.active.stop();
            }
            slot.placeholder.stop();
            tracing::debug!("{kind} tracks released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDevices, MockPeer};
    use serde_json::json;

    async fn manager_with_sender(
        devices: &MockDevices,
        peer: &MockPeer,
        kind: MediaKind,
    ) -> MediaTrackManager {
        let mut media = MediaTrackManager::with_placeholders(devices, &[kind]).unwrap();
        let sender = peer
            .add_transceiver(
                kind,
                crate::peer::TransceiverDirection::SendOnly,
                media.placeholder(kind),
            )
            .await
            .unwrap()
            .unwrap();
        media.bind_sender(kind, sender);
        media
    }

    #[tokio::test]
    async fn swap_keeps_sender_identity() {
        let devices = MockDevices::new();
        let peer = MockPeer::new();
        let mut media = manager_with_sender(&devices, &peer, MediaKind::Video).await;
        let sender = media.sender(MediaKind::Video).unwrap();

        let camera = devices
            .capture(MediaKind::Video, &CaptureConstraints::default())
            .await
            .unwrap();
        media
            .swap_in(&peer, MediaKind::Video, camera.clone())
            .await
            .unwrap();
        assert!(media.is_capturing(MediaKind::Video));

        assert!(media.swap_out(&peer, MediaKind::Video).await.unwrap());
        assert!(!media.is_capturing(MediaKind::Video));
        assert!(devices.is_stopped(camera.id()));

        let replaced = peer.state().replaced.clone();
        assert_eq!(replaced.len(), 2);
        assert!(replaced.iter().all(|(s, _)| *s == sender));
        assert_eq!(replaced[0].1, camera.id());
        assert_eq!(
            replaced[1].1,
            media.placeholder(MediaKind::Video).unwrap().id()
        );
    }

    #[tokio::test]
    async fn swap_out_without_capture_is_noop() {
        let devices = MockDevices::new();
        let peer = MockPeer::new();
        let mut media = manager_with_sender(&devices, &peer, MediaKind::Video).await;

        assert!(!media.swap_out(&peer, MediaKind::Video).await.unwrap());
        assert!(peer.state().replaced.is_empty());
        assert!(!media.swap_out(&peer, MediaKind::Audio).await.unwrap());
    }

    #[tokio::test]
    async fn close_invalidates_pending_open() {
        let devices = MockDevices::new();
        let peer = MockPeer::new();
        let mut media = manager_with_sender(&devices, &peer, MediaKind::Audio).await;

        let ticket = media.begin_open(MediaKind::Audio).unwrap();
        assert!(media.is_current(MediaKind::Audio, ticket));
        media.swap_out(&peer, MediaKind::Audio).await.unwrap();
        assert!(!media.is_current(MediaKind::Audio, ticket));
    }

    #[tokio::test]
    async fn unconfigured_kind_has_no_ticket() {
        let devices = MockDevices::new();
        let mut media = MediaTrackManager::with_placeholders(&devices, &[MediaKind::Audio]).unwrap();
        assert!(media.begin_open(MediaKind::Video).is_none());
        // No sender bound yet either.
        assert!(media.begin_open(MediaKind::Audio).is_none());
    }

    #[tokio::test]
    async fn reopen_stops_previous_capture() {
        let devices = MockDevices::new();
        let peer = MockPeer::new();
        let mut media = manager_with_sender(&devices, &peer, MediaKind::Audio).await;

        let first = devices
            .capture(MediaKind::Audio, &CaptureConstraints::default())
            .await
            .unwrap();
        let second = devices
            .capture(MediaKind::Audio, &CaptureConstraints::default())
            .await
            .unwrap();
        media.swap_in(&peer, MediaKind::Audio, first.clone()).await.unwrap();
        media.swap_in(&peer, MediaKind::Audio, second.clone()).await.unwrap();

        assert!(devices.is_stopped(first.id()));
        assert!(!devices.is_stopped(second.id()));
    }

    #[tokio::test]
    async fn failed_replace_stops_new_track() {
        let devices = MockDevices::new();
        let peer = MockPeer::new();
        let mut media = manager_with_sender(&devices, &peer, MediaKind::Video).await;
        peer.state().fail_replace = true;

        let camera = devices
            .capture(MediaKind::Video, &CaptureConstraints::default())
            .await
            .unwrap();
        let err = media
            .swap_in(&peer, MediaKind::Video, camera.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::DeviceAccess(_)));
        assert!(devices.is_stopped(camera.id()));
        assert!(!media.is_capturing(MediaKind::Video));
    }

    #[test]
    fn release_all_stops_everything() {
        let devices = MockDevices::new();
        let mut media =
            MediaTrackManager::with_placeholders(&devices, &[MediaKind::Audio, MediaKind::Video])
                .unwrap();
        let audio = media.placeholder(MediaKind::Audio).unwrap();
        let video = media.placeholder(MediaKind::Video).unwrap();
        media.release_all();
        assert!(devices.is_stopped(audio.id()));
        assert!(devices.is_stopped(video.id()));
        assert!(media.slot(MediaKind::Audio).is_none());
    }

    #[test]
    fn constraints_from_control_data() {
        let c = CaptureConstraints::from_data(&json!({"sample_rate": 48000, "channel_count": 2}))
            .unwrap();
        assert_eq!(c.sample_rate, Some(48000));
        assert_eq!(c.channel_count, Some(2));
        assert_eq!(CaptureConstraints::from_data(&Value::Null).unwrap(), CaptureConstraints::default());
    }
}
