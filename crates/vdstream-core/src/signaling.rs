//! Signaling wire format and the channel capability that carries it.
//!
//! SDP and ICE candidate payloads are base64 on the wire. The session never
//! looks inside them; they are decoded only to hand plain text to the peer
//! connection.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::errors::StreamError;
use crate::transport::TransportEvents;

/// Messages exchanged over the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
    },
    Error {
        message: String,
    },
    Settings {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        foreground_activity: Option<String>,
    },
}

/// ICE candidate in plain (decoded) form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl SignalingMessage {
    pub fn offer(sdp: &str) -> Self {
        SignalingMessage::Offer { sdp: encode(sdp) }
    }

    pub fn answer(sdp: &str) -> Self {
        SignalingMessage::Answer { sdp: encode(sdp) }
    }

    pub fn candidate(candidate: &IceCandidate) -> Self {
        SignalingMessage::Candidate {
            candidate: encode(&candidate.candidate),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
        }
    }

    pub fn parse(text: &str) -> Result<Self, StreamError> {
        serde_json::from_str(text)
            .map_err(|e| StreamError::Protocol(format!("invalid signaling message: {e}")))
    }

    pub fn to_json(&self) -> Result<String, StreamError> {
        serde_json::to_string(self)
            .map_err(|e| StreamError::Protocol(format!("encode signaling message: {e}")))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::Error { .. } => "error",
            SignalingMessage::Settings { .. } => "settings",
        }
    }

    /// Decoded SDP of an offer or answer.
    pub fn sdp(&self) -> Result<String, StreamError> {
        match self {
            SignalingMessage::Offer { sdp } | SignalingMessage::Answer { sdp } => decode(sdp),
            other => Err(StreamError::Protocol(format!(
                "'{}' message carries no sdp",
                other.kind()
            ))),
        }
    }

    /// Decoded candidate of a `candidate` message.
    pub fn ice_candidate(&self) -> Result<IceCandidate, StreamError> {
        match self {
            SignalingMessage::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => Ok(IceCandidate {
                candidate: decode(candidate)?,
                sdp_mid: sdp_mid.clone(),
                sdp_mline_index: *sdp_mline_index,
            }),
            other => Err(StreamError::Protocol(format!(
                "'{}' message carries no candidate",
                other.kind()
            ))),
        }
    }
}

fn encode(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

fn decode(blob: &str) -> Result<String, StreamError> {
    let bytes = STANDARD
        .decode(blob.trim())
        .map_err(|e| StreamError::Protocol(format!("invalid base64 payload: {e}")))?;
    String::from_utf8(bytes).map_err(|e| StreamError::Protocol(format!("payload is not utf-8: {e}")))
}

/// An open (or opening) ordered message channel to the signaling endpoint.
pub trait SignalingChannel: Send + Sync {
    fn send(&self, message: &SignalingMessage) -> Result<(), StreamError>;

    /// Close the channel. Must be safe to call more than once.
    fn close(&self);
}

/// Opens signaling channels.
///
/// `open` returns immediately; the channel reports `SignalingOpened`,
/// `SignalingMessage`, `SignalingError` and `SignalingClosed` through `events`.
pub trait SignalingTransport: Send + Sync {
    fn open(
        &self,
        url: &str,
        events: TransportEvents,
    ) -> Result<Box<dyn SignalingChannel>, StreamError>;
}
