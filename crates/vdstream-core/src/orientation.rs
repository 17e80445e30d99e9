use serde_json::json;

use crate::control::ControlMessage;

pub const CHANGE_ORIENTATION: &str = "screen::change_orientation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayOrientation {
    #[default]
    Portrait,
    Landscape,
    ReversePortrait,
    ReverseLandscape,
}

impl DisplayOrientation {
    pub fn degrees(&self) -> u16 {
        match self {
            DisplayOrientation::Portrait => 0,
            DisplayOrientation::Landscape => 90,
            DisplayOrientation::ReversePortrait => 180,
            DisplayOrientation::ReverseLandscape => 270,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayOrientation::Portrait => "portrait",
            DisplayOrientation::Landscape => "landscape",
            DisplayOrientation::ReversePortrait => "reverse-portrait",
            DisplayOrientation::ReverseLandscape => "reverse-landscape",
        }
    }

    pub fn from_degrees(degrees: i32) -> Self {
        match degrees.rem_euclid(360) {
            90 => DisplayOrientation::Landscape,
            180 => DisplayOrientation::ReversePortrait,
            270 => DisplayOrientation::ReverseLandscape,
            _ => DisplayOrientation::Portrait,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rotation {
    /// Signed shortest turn from the previous orientation, in degrees.
    pub delta: i32,
    /// Accumulated rotation since tracking started, in `0..360`.
    pub net: u16,
    pub message: ControlMessage,
}

/// Follows the local display orientation and turns changes into control messages.
#[derive(Debug, Default)]
pub struct OrientationTracker {
    current: DisplayOrientation,
    net: i32,
}

impl OrientationTracker {
    pub fn new(initial: DisplayOrientation) -> Self {
        Self {
            current: initial,
            net: 0,
        }
    }

    pub fn current(&self) -> DisplayOrientation {
        self.current
    }

    pub fn net_rotation(&self) -> u16 {
        self.net.rem_euclid(360) as u16
    }

    /// Returns `None` when already at `target`.
    pub fn rotate_to(&mut self, target: DisplayOrientation) -> Option<Rotation> {
        if target == self.current {
            return None;
        }
        let mut delta = i32::from(target.degrees()) - i32::from(self.current.degrees());
        if delta > 180 {
            delta -= 360;
        } else if delta < -180 {
            delta += 360;
        }
        self.net = (self.net + delta).rem_euclid(360);
        self.current = target;
        tracing::debug!("orientation -> {} ({delta:+}°)", target.as_str());

        Some(Rotation {
            delta,
            net: self.net_rotation(),
            message: ControlMessage::new(
                CHANGE_ORIENTATION,
                json!({ "orientation": target.as_str() }),
            ),
        })
    }
}
