use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::StreamError;

/// STUN/TURN server handed to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Everything needed to reach a remote instance, as produced by a [`Connector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    /// WebSocket URL (wss://) of the signaling endpoint.
    pub signaling_url: String,
    pub ice_servers: Vec<IceServer>,
}

/// Creates or joins a session on a backend.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<SessionInfo, StreamError>;

    /// Release whatever `connect()` reserved. Called once on teardown.
    async fn disconnect(&self);
}

/// Joins an already known session.
pub struct StaticConnector {
    info: SessionInfo,
}

impl StaticConnector {
    pub fn new(info: SessionInfo) -> Self {
        Self { info }
    }
}

#[async_trait]
impl Connector for StaticConnector {
    async fn connect(&self) -> Result<SessionInfo, StreamError> {
        Ok(self.info.clone())
    }

    async fn disconnect(&self) {}
}

/// Rewrite an http(s) URL into its WebSocket counterpart.
pub(crate) fn to_websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
