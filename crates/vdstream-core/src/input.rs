//! Typed input events sent to the remote instance over the control channel.
//!
//! Coordinates and codes are already mapped to the remote device's space;
//! this module only fixes the wire shape of each event.

use serde::{Deserialize, Serialize};

use crate::control::ControlMessage;
use crate::errors::StreamError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InputEvent {
    #[serde(rename = "input::key")]
    Key { code: u32, pressed: bool },
    #[serde(rename = "input::mouse-move")]
    MouseMove { x: f64, y: f64, rx: f64, ry: f64 },
    #[serde(rename = "input::mouse-button")]
    MouseButton { button: u8, pressed: bool },
    #[serde(rename = "input::mouse-wheel")]
    MouseWheel { x: f64, y: f64 },
    #[serde(rename = "input::touch-start")]
    TouchStart(TouchPoint),
    #[serde(rename = "input::touch-move")]
    TouchMove(TouchPoint),
    #[serde(rename = "input::touch-end")]
    TouchEnd { id: u32 },
    #[serde(rename = "input::touch-cancel")]
    TouchCancel { id: u32 },
    #[serde(rename = "input::gamepad-button")]
    GamepadButton { id: u32, index: u32, pressed: bool },
    #[serde(rename = "input::gamepad-axes")]
    GamepadAxes { id: u32, index: u32, value: f64 },
    #[serde(rename = "input::ime-event")]
    Ime(ImeEvent),
    #[serde(rename = "location::update-position")]
    UpdatePosition(Position),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchPoint {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub pressure: f64,
}

/// Soft keyboard activity forwarded while the remote IME is visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ImeEvent {
    Text { text: String },
    ComposingText { text: String },
    Keycode { code: u32 },
    DeleteBackward { count: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub time: i64,
}

impl InputEvent {
    pub fn to_message(&self) -> Result<ControlMessage, StreamError> {
        let value = serde_json::to_value(self)
            .map_err(|e| StreamError::Protocol(format!("encode input event: {e}")))?;
        serde_json::from_value(value)
            .map_err(|e| StreamError::Protocol(format!("encode input event: {e}")))
    }
}
