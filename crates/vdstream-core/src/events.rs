use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::errors::StreamError;
use crate::stats::StatsSnapshot;

/// Events emitted by the core to the session owner.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    StateChanged(SessionState),
    /// Connectivity established for the first time; remote media is flowing.
    Ready,
    /// Fatal errors arrive after teardown; non-fatal ones leave the session running.
    Error(StreamError),
    /// Clean shutdown, either requested through `stop()` or initiated by the remote side.
    Closed,
    MessageReceived { kind: String, data: Value },
    StatsUpdated(StatsSnapshot),
    ImeVisibilityChanged(bool),
    RemoteSettings {
        device_type: Option<String>,
        foreground_activity: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    SignalingOpen,
    Negotiating,
    Connected,
    Disconnected,
    TimedOut,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::SignalingOpen => "signaling-open",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::TimedOut => "timed-out",
            SessionState::Failed => "failed",
        }
    }
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from the session task).
pub trait StreamEventListener: Send + Sync {
    fn on_event(&self, event: StreamEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn StreamEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn StreamEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn emit(&self, event: StreamEvent) {
        // Snapshot the list so a listener may register another one (or stop
        // the session) from inside its callback.
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
