use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("connector failed: {0}")]
    Connector(String),
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("timed out")]
    NegotiationTimeout,
    #[error("lost connection")]
    ConnectionLost,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("device access failed: {0}")]
    DeviceAccess(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("http error: {0}")]
    Http(String),
}

impl StreamError {
    /// Whether this error ends the session.
    ///
    /// Fatal errors are only ever raised after the session has been torn
    /// down; the owner never needs to call `stop()` after receiving one.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::Connector(_)
                | StreamError::Signaling(_)
                | StreamError::NegotiationTimeout
                | StreamError::ConnectionLost
                | StreamError::ConnectionFailed
                | StreamError::Transport(_)
        )
    }
}
