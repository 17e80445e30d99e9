//! webrtc-rs and tokio-tungstenite adapters for vdstream-core.
//!
//! [`RtcPeerFactory`] provides peer connections, [`WsSignalingTransport`]
//! the signaling socket and [`RtcMediaDevices`] the local tracks.

pub mod error;
pub mod peer;
pub mod signaling;
pub mod stats;
pub mod track;

pub use error::RtcError;
pub use peer::{RemoteTrackHandler, RtcControlChannel, RtcPeer, RtcPeerFactory};
pub use signaling::WsSignalingTransport;
pub use track::{CaptureBackend, RtcMediaDevices, SampleTrack};

use std::sync::Arc;

use vdstream_core::{AllowAll, DevicePermission, SessionDeps};

/// Session dependencies wired to the webrtc-rs stack.
pub fn session_deps(devices: RtcMediaDevices, permissions: Arc<dyn DevicePermission>) -> SessionDeps {
    SessionDeps {
        signaling: Arc::new(WsSignalingTransport::new()),
        peers: Arc::new(RtcPeerFactory::new()),
        devices: Arc::new(devices),
        permissions,
    }
}

/// [`session_deps`] with no capture backends and every permission granted.
pub fn default_session_deps() -> SessionDeps {
    session_deps(RtcMediaDevices::new(), Arc::new(AllowAll))
}
