//! Control channel protocol.
//!
//! Every message is a `{type, data}` envelope. The session interprets device
//! lifecycle and IME visibility requests; everything else is handed to the
//! owner untouched.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::StreamError;
use crate::media::CaptureConstraints;

pub const STREAM_DISCONNECT: &str = "stream::disconnect";

const OPEN_CAMERA: &str = "open-camera";
const CLOSE_CAMERA: &str = "close-camera";
const ENABLE_MICROPHONE: &str = "enable-microphone";
const DISABLE_MICROPHONE: &str = "disable-microphone";
const SHOW_IME: &str = "show-ime";
const HIDE_IME: &str = "hide-ime";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ControlMessage {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        let data = if data.is_null() { empty_object() } else { data };
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn parse(text: &str) -> Result<Self, StreamError> {
        serde_json::from_str(text)
            .map_err(|e| StreamError::Protocol(format!("invalid control message: {e}")))
    }

    pub fn to_json(&self) -> Result<String, StreamError> {
        serde_json::to_string(self)
            .map_err(|e| StreamError::Protocol(format!("encode control message: {e}")))
    }
}

/// Inbound control message, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    OpenCamera(CaptureConstraints),
    CloseCamera,
    EnableMicrophone(CaptureConstraints),
    DisableMicrophone,
    ShowIme,
    HideIme,
    Other(ControlMessage),
}

impl ControlCommand {
    pub fn from_message(msg: ControlMessage) -> Result<Self, StreamError> {
        let command = match msg.kind.as_str() {
            OPEN_CAMERA => ControlCommand::OpenCamera(CaptureConstraints::from_data(&msg.data)?),
            CLOSE_CAMERA => ControlCommand::CloseCamera,
            ENABLE_MICROPHONE => {
                ControlCommand::EnableMicrophone(CaptureConstraints::from_data(&msg.data)?)
            }
            DISABLE_MICROPHONE => ControlCommand::DisableMicrophone,
            SHOW_IME => ControlCommand::ShowIme,
            HIDE_IME => ControlCommand::HideIme,
            _ => ControlCommand::Other(msg),
        };
        Ok(command)
    }
}

/// The platform data channel underneath the protocol.
pub trait ControlChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Queue a text frame. Frames are delivered in call order.
    fn send_text(&self, text: String) -> Result<(), StreamError>;

    fn close(&self);
}

/// Shared slot holding the session's control channel.
///
/// The session attaches the channel during negotiation and detaches it on
/// teardown; owners send through the same slot from any thread.
#[derive(Clone, Default)]
pub struct ControlLink {
    channel: Arc<Mutex<Option<Arc<dyn ControlChannel>>>>,
}

impl ControlLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, channel: Arc<dyn ControlChannel>) {
        *self.lock() = Some(channel);
    }

    /// Drop and close the channel, if any.
    pub fn detach(&self) {
        let channel = self.lock().take();
        if let Some(channel) = channel {
            channel.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().as_ref().is_some_and(|c| c.is_open())
    }

    /// Send `{type, data}` if the channel is open.
    ///
    /// Returns `false` instead of failing when there is no open channel, so
    /// periodic senders can ignore transient channel states.
    pub fn send(&self, kind: &str, data: Value) -> bool {
        self.send_message(&ControlMessage::new(kind, data))
    }

    pub fn send_message(&self, msg: &ControlMessage) -> bool {
        let channel = self.lock().clone();
        let Some(channel) = channel else {
            return false;
        };
        if !channel.is_open() {
            return false;
        }
        let text = match msg.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("dropping control message '{}': {e}", msg.kind);
                return false;
            }
        };
        match channel.send_text(text) {
            Ok(()) => {
                tracing::debug!("control message sent: {}", msg.kind);
                true
            }
            Err(e) => {
                tracing::debug!("control message '{}' not sent: {e}", msg.kind);
                false
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn ControlChannel>>> {
        self.channel.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeChannel {
        open: AtomicBool,
        closed: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    impl FakeChannel {
        fn new(open: bool) -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(open),
                closed: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl ControlChannel for FakeChannel {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn send_text(&self, text: String) -> Result<(), StreamError> {
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn send_without_channel_reports_false() {
        let link = ControlLink::new();
        assert!(!link.send("input::key", json!({"code": 30, "pressed": true})));
    }

    #[test]
    fn send_on_closed_channel_reports_false() {
        let link = ControlLink::new();
        let channel = FakeChannel::new(false);
        link.attach(channel.clone());
        assert!(!link.send("input::key", json!({})));
        assert!(channel.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn send_serializes_envelope() {
        let link = ControlLink::new();
        let channel = FakeChannel::new(true);
        link.attach(channel.clone());

        assert!(link.send(STREAM_DISCONNECT, Value::Null));
        let sent = channel.sent.lock().unwrap();
        let msg = ControlMessage::parse(&sent[0]).unwrap();
        assert_eq!(msg.kind, STREAM_DISCONNECT);
        assert_eq!(msg.data, json!({}));
    }

    #[test]
    fn detach_closes_channel() {
        let link = ControlLink::new();
        let channel = FakeChannel::new(true);
        link.attach(channel.clone());
        link.detach();
        assert!(channel.closed.load(Ordering::SeqCst));
        assert!(!link.is_open());
    }

    #[test]
    fn classifies_device_and_ime_commands() {
        let open = ControlMessage::parse(
            r#"{"type":"open-camera","data":{"width":640,"height":480,"frame_rate":30}}"#,
        )
        .unwrap();
        match ControlCommand::from_message(open).unwrap() {
            ControlCommand::OpenCamera(c) => {
                assert_eq!(c.width, Some(640));
                assert_eq!(c.frame_rate, Some(30));
            }
            other => panic!("expected OpenCamera, got {other:?}"),
        }

        let hide = ControlMessage::parse(r#"{"type":"hide-ime"}"#).unwrap();
        assert_eq!(ControlCommand::from_message(hide).unwrap(), ControlCommand::HideIme);
    }

    #[test]
    fn unknown_types_pass_through() {
        let msg = ControlMessage::new("app::custom", json!({"answer": 42}));
        assert_eq!(
            ControlCommand::from_message(msg.clone()).unwrap(),
            ControlCommand::Other(msg)
        );
    }

    #[test]
    fn malformed_constraints_are_protocol_errors() {
        let msg = ControlMessage::new(ENABLE_MICROPHONE, json!({"sample_rate": "fast"}));
        assert!(matches!(
            ControlCommand::from_message(msg),
            Err(StreamError::Protocol(_))
        ));
    }
}
