use tokio::sync::mpsc;

use crate::peer::ConnectionState;
use crate::signaling::IceCandidate;

/// Callbacks from the signaling channel and the peer connection.
///
/// Adapters push these from whatever thread their platform uses; the session
/// consumes them one at a time in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    SignalingOpened,
    SignalingMessage(String),
    SignalingError(String),
    SignalingClosed,
    /// Locally gathered candidate to be trickled to the remote side.
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(ConnectionState),
    ControlOpened,
    ControlMessage(String),
    ControlClosed,
}

/// Cloneable sink handed to transport adapters.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event. Events sent after the session ended are dropped.
    pub fn emit(&self, event: TransportEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("transport event dropped: session gone");
        }
    }
}
