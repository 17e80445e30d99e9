//! Peer connection capability.
//!
//! The platform supplies ICE, SDP handling, transceivers and data channels;
//! the session only drives them through this interface.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::connector::IceServer;
use crate::control::ControlChannel;
use crate::errors::StreamError;
use crate::media::LocalTrack;
use crate::signaling::IceCandidate;
use crate::stats::StatsReport;
use crate::transport::TransportEvents;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl TransceiverDirection {
    /// Direction of the single audio transceiver.
    pub fn for_audio(speaker: bool, microphone: bool) -> Self {
        match (speaker, microphone) {
            (true, true) => TransceiverDirection::SendRecv,
            (true, false) => TransceiverDirection::RecvOnly,
            (false, true) => TransceiverDirection::SendOnly,
            (false, false) => TransceiverDirection::Inactive,
        }
    }

    pub fn sends(&self) -> bool {
        matches!(self, TransceiverDirection::SendRecv | TransceiverDirection::SendOnly)
    }
}

/// Stable handle on an outbound sender. Track swaps never change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u32);

/// ICE connectivity as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Completed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Checking => "checking",
            ConnectionState::Connected => "connected",
            ConnectionState::Completed => "completed",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Add a transceiver, optionally sending `track` from the start.
    ///
    /// Returns the sender id for directions that send, which later
    /// [`PeerConnection::replace_track`] calls target.
    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
        track: Option<Arc<dyn LocalTrack>>,
    ) -> Result<Option<SenderId>, StreamError>;

    /// Create the reliable, ordered control data channel.
    async fn create_control_channel(&self, label: &str)
    -> Result<Arc<dyn ControlChannel>, StreamError>;

    /// Build a local offer, apply it as local description and return its SDP.
    async fn create_offer(&self) -> Result<String, StreamError>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), StreamError>;

    /// Apply a remote candidate. Must accept candidates that arrive before the answer.
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), StreamError>;

    /// Swap the media source of `sender` without renegotiating.
    async fn replace_track(
        &self,
        sender: SenderId,
        track: Arc<dyn LocalTrack>,
    ) -> Result<(), StreamError>;

    async fn stats(&self) -> Result<StatsReport, StreamError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a peer connection that reports local candidates, connectivity
    /// and control channel traffic through `events`.
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerConnection>, StreamError>;
}
