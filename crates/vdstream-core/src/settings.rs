use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;

/// Device preferences persisted between sessions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default = "default_true")]
    pub speaker_enabled: bool,
    #[serde(default)]
    pub microphone_enabled: bool,
    #[serde(default)]
    pub camera_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            speaker_enabled: true,
            microphone_enabled: false,
            camera_enabled: false,
        }
    }
}

impl Settings {
    /// Apply the device preferences on top of `base`.
    pub fn session_config(&self, base: SessionConfig) -> SessionConfig {
        SessionConfig {
            enable_speaker: self.speaker_enabled,
            enable_microphone: self.microphone_enabled,
            enable_camera: self.camera_enabled,
            ..base
        }
    }
}

pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn set_speaker_enabled(&self, enabled: bool) {
        self.lock().speaker_enabled = enabled;
        self.save();
    }

    pub fn set_microphone_enabled(&self, enabled: bool) {
        self.lock().microphone_enabled = enabled;
        self.save();
    }

    pub fn set_camera_enabled(&self, enabled: bool) {
        self.lock().camera_enabled = enabled;
        self.save();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self) {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("failed to persist settings: {e}");
                }
            }
            Err(e) => tracing::warn!("failed to serialize settings: {e}"),
        }
    }

    fn load(path: &PathBuf) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Settings::default(),
        }
    }
}
