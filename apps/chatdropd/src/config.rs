//! Daemon configuration.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/chatdrop/chatdropd.toml`
//! - Windows: `%APPDATA%/chatdrop/chatdropd.toml`
//!
//! A path given on the command line takes precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chatdrop_ingest::{StaticRoster, UploadPolicy};
use serde::{Deserialize, Serialize};

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket server port (0 = auto-assign).
    #[serde(default)]
    pub listen_port: u16,

    /// Root directory for stored files and the record journal.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Largest accepted upload in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// `type/subtype` or `type/*` patterns. Empty allows everything.
    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How long finished uploads stay queryable.
    #[serde(default = "default_status_retention_secs")]
    pub status_retention_secs: u64,

    /// Prefix of the download path reported to uploaders.
    #[serde(default = "default_download_prefix")]
    pub download_prefix: String,

    /// Rooms and who may upload into them.
    #[serde(default)]
    pub rooms: Vec<RoomConfig>,
}

/// One `[[rooms]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub id: String,
    #[serde(default)]
    pub participants: Vec<String>,
}

fn default_storage_root() -> PathBuf {
    data_dir().join("storage")
}

fn default_max_upload_bytes() -> u64 {
    UploadPolicy::default().max_upload_bytes
}

fn default_allowed_content_types() -> Vec<String> {
    UploadPolicy::default().allowed_content_types
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_status_retention_secs() -> u64 {
    600
}

fn default_download_prefix() -> String {
    "/files".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 0,
            storage_root: default_storage_root(),
            max_upload_bytes: default_max_upload_bytes(),
            allowed_content_types: default_allowed_content_types(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            status_retention_secs: default_status_retention_secs(),
            download_prefix: default_download_prefix(),
            rooms: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the default location), creating
    /// the file with defaults if it does not exist.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p,
            None => config_path(),
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            tracing::info!(path = %path.display(), "created default configuration");
            Ok(config)
        }
    }

    /// Writes the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// The limits and timers handed to the upload coordinator.
    pub fn to_policy(&self) -> UploadPolicy {
        UploadPolicy {
            max_upload_bytes: self.max_upload_bytes,
            allowed_content_types: self.allowed_content_types.clone(),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            status_retention: Duration::from_secs(self.status_retention_secs),
            ..UploadPolicy::default()
        }
    }

    /// Room membership from the `[[rooms]]` tables.
    pub fn roster(&self) -> StaticRoster {
        self.rooms.iter().fold(StaticRoster::new(), |roster, room| {
            roster.with_room(room.id.clone(), room.participants.iter().cloned())
        })
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> PathBuf {
    config_dir().join("chatdropd.toml")
}

fn config_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("chatdrop")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config").join("chatdrop")
    }
}

fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        config_dir()
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".local").join("share").join("chatdrop")
    }
}
