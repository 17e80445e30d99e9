use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::StreamError;

/// Environment variable pointing at an explicit gateway config file.
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";
/// Fallback root, as set by the snap confinement.
pub const SNAP_COMMON_ENV: &str = "SNAP_COMMON";

/// Per-session behavior knobs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionConfig {
    #[serde(default = "default_true")]
    pub enable_speaker: bool,
    #[serde(default)]
    pub enable_microphone: bool,
    #[serde(default)]
    pub enable_camera: bool,
    #[serde(default = "default_signaling_timeout")]
    pub signaling_timeout_secs: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,
    #[serde(default = "default_control_label")]
    pub control_channel_label: String,
}

fn default_true() -> bool {
    true
}

fn default_signaling_timeout() -> u64 {
    5 * 60
}

fn default_grace_period() -> u64 {
    10
}

fn default_stats_interval() -> u64 {
    1000
}

fn default_control_label() -> String {
    "control".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enable_speaker: true,
            enable_microphone: false,
            enable_camera: false,
            signaling_timeout_secs: default_signaling_timeout(),
            grace_period_secs: default_grace_period(),
            stats_interval_ms: default_stats_interval(),
            control_channel_label: default_control_label(),
        }
    }
}

impl SessionConfig {
    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_secs(self.signaling_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }
}

/// Gateway service settings, read from a flat YAML mapping.
///
/// Unknown keys are kept so callers can look up deployment specific options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfig {
    values: BTreeMap<String, serde_yaml::Value>,
}

impl GatewayConfig {
    /// Load from `path`, then `$CONFIG_PATH`, then `$SNAP_COMMON/service/config.yaml`.
    ///
    /// No candidate path at all yields an empty config.
    pub fn load(path: Option<&Path>) -> Result<Self, StreamError> {
        match Self::resolve_path(path) {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn resolve_path(path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = path {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        std::env::var(SNAP_COMMON_ENV)
            .ok()
            .filter(|root| !root.is_empty())
            .map(|root| PathBuf::from(root).join("service").join("config.yaml"))
    }

    pub fn from_file(path: &Path) -> Result<Self, StreamError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StreamError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, StreamError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let values: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(contents)
            .map_err(|e| StreamError::Config(format!("invalid config: {e}")))?;
        Ok(Self { values })
    }

    /// Look up a required string option.
    pub fn require(&self, key: &str) -> Result<String, StreamError> {
        self.get(key)
            .ok_or_else(|| StreamError::Config(format!("configuration option '{key}' not present")))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn gateway_url(&self) -> Option<String> {
        self.get("gateway-url").filter(|s| !s.is_empty())
    }

    pub fn gateway_token(&self) -> Option<String> {
        self.get("gateway-token").filter(|s| !s.is_empty())
    }

    pub fn gateway_enabled(&self) -> bool {
        self.gateway_url().is_some() && self.gateway_token().is_some()
    }
}
