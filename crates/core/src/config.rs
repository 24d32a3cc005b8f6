use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const STASH_FILE: &str = "stash.json";
pub const SOCKET_FILE: &str = "daemon.sock";
pub const PID_FILE: &str = "daemon.pid";
pub const CONFIG_FILE: &str = "config.toml";

pub const DEFAULT_INACTIVITY_LOCK_SECONDS: u64 = 900;
pub const DEFAULT_CLIPBOARD_CLEAR_SECONDS: u64 = 30;

/// Host-supplied settings, read once at startup. Timer values come from an
/// optional config.toml inside the data directory.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    /// Auto-lock after this many seconds without a request. 0 disables.
    pub inactivity_lock_seconds: u64,
    pub clipboard_clear_seconds: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    inactivity_lock_seconds: Option<u64>,
    clipboard_clear_seconds: Option<u64>,
}

impl Settings {
    pub fn with_defaults(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            inactivity_lock_seconds: DEFAULT_INACTIVITY_LOCK_SECONDS,
            clipboard_clear_seconds: DEFAULT_CLIPBOARD_CLEAR_SECONDS,
        }
    }

    /// Resolve settings for the given data directory (or the platform
    /// default), applying overrides from config.toml when present.
    pub fn load(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let mut settings = Self::with_defaults(data_dir);

        let config_path = settings.config_path();
        if config_path.is_file() {
            let raw = fs::read_to_string(&config_path)
                .with_context(|| format!("failed reading {}", config_path.display()))?;
            let parsed: ConfigFile = toml::from_str(&raw)
                .with_context(|| format!("failed parsing {}", config_path.display()))?;
            if let Some(seconds) = parsed.inactivity_lock_seconds {
                settings.inactivity_lock_seconds = seconds;
            }
            if let Some(seconds) = parsed.clipboard_clear_seconds {
                settings.clipboard_clear_seconds = seconds;
            }
        }

        Ok(settings)
    }

    pub fn stash_path(&self) -> PathBuf {
        self.data_dir.join(STASH_FILE)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join(SOCKET_FILE)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join(PID_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("stashd")
}
