use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::SessionError;

/// Tunables for a [`Session`](crate::Session).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Quiet period before a burst of hot-plug notifications refreshes the device list.
    #[serde(default = "default_debounce_ms")]
    pub device_change_debounce_ms: u64,
    /// Consecutive self-triggered firings after which a reactor is treated
    /// as looping. `None` disables the guard; it is off by default in
    /// release builds.
    #[serde(default = "default_loop_threshold")]
    pub reactor_loop_threshold: Option<usize>,
    #[serde(default = "default_true")]
    pub camera_enabled_on_join: bool,
    #[serde(default = "default_true")]
    pub microphone_enabled_on_join: bool,
}

fn default_api_base_url() -> String {
    "https://api.whereby.dev/v1".to_string()
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_loop_threshold() -> Option<usize> {
    cfg!(debug_assertions).then_some(100)
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            device_change_debounce_ms: default_debounce_ms(),
            reactor_loop_threshold: default_loop_threshold(),
            camera_enabled_on_join: true,
            microphone_enabled_on_join: true,
        }
    }
}

impl SessionConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|e| SessionError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Like [`from_file`](Self::from_file) but falls back to defaults on any error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("using default session config: {e}");
                Self::default()
            }
        }
    }

    pub fn device_change_debounce(&self) -> Duration {
        Duration::from_millis(self.device_change_debounce_ms)
    }
}
