//! vdstream core session logic.
//!
//! Pure Rust crate with no platform dependencies. Signaling transports, peer
//! connections and capture devices are injected through the traits in
//! [`signaling`], [`peer`] and [`media`].

pub mod config;
pub mod connector;
pub mod control;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod input;
pub mod machine;
pub mod media;
pub mod orientation;
pub mod peer;
pub mod session;
pub mod settings;
pub mod signaling;
pub mod stats;
pub mod transport;

mod timers;

#[cfg(test)]
mod testing;

pub use config::{GatewayConfig, SessionConfig};
pub use connector::{Connector, IceServer, SessionInfo, StaticConnector};
pub use control::{ControlChannel, ControlLink, ControlMessage};
pub use errors::StreamError;
pub use events::{SessionState, StreamEvent, StreamEventListener};
pub use gateway::{GatewayApi, GatewayConnector, SessionRequest};
pub use input::InputEvent;
pub use media::{AllowAll, CaptureConstraints, DevicePermission, LocalTrack, MediaDevices};
pub use orientation::DisplayOrientation;
pub use peer::{
    ConnectionState, MediaKind, PeerConnection, PeerConnectionFactory, SenderId,
    TransceiverDirection,
};
pub use session::{SessionDeps, StreamSession};
pub use settings::SettingsStore;
pub use signaling::{IceCandidate, SignalingChannel, SignalingMessage, SignalingTransport};
pub use stats::{StatsReport, StatsSnapshot};
pub use transport::{TransportEvent, TransportEvents};
