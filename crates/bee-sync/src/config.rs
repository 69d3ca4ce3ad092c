//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     BEE_SERVER_URL=ws://10.0.0.2:5000/ws                               │
//! │     BEE_DEVICE_ID=bee-0042                                             │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     explicit path (first CLI argument), or                             │
//! │     ~/.config/bee-agent/agent.toml (Linux)                             │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     ws://127.0.0.1:5000/ws, auto-generated device_id                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # agent.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Hallway"
//!
//! [server]
//! url = "ws://127.0.0.1:5000/ws"
//! enabled = true
//! media_url = "http://127.0.0.1:5000/"
//! reconnect_delay_ms = 5000
//! download_timeout_secs = 30
//!
//! [startup]
//! configuration_timeout_ms = 10000
//! media_timeout_ms = 5000
//!
//! [storage]
//! configuration_dir = "/usr/share/bee/configuration"
//! media_dir = "/usr/share/bee/media"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Settings
// =============================================================================

/// Identity of this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Unique device identifier.
    /// Auto-generated on first run if not provided.
    #[serde(default = "default_device_id")]
    pub id: String,

    /// Human-readable device name.
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_device_name() -> String {
    "Bee Device".to_string()
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            id: default_device_id(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Server Settings
// =============================================================================

/// Where the backend lives and how to stay connected to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// When false the device never connects and runs from local state.
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,

    /// WebSocket endpoint for RPC and topic pushes.
    #[serde(default = "default_server_url")]
    pub url: String,

    /// Base URL media files are downloaded from (`<media_url>/media/<name>`).
    #[serde(default = "default_media_url")]
    pub media_url: String,

    /// Fixed delay between a disconnect and the next connect attempt.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Connection timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Interval between WebSocket pings (seconds).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Upper bound on one media download (seconds).
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

fn default_server_enabled() -> bool {
    true
}
fn default_server_url() -> String {
    "ws://127.0.0.1:5000/ws".to_string()
}
fn default_media_url() -> String {
    "http://127.0.0.1:5000/".to_string()
}
fn default_reconnect_delay() -> u64 {
    5000
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_ping_interval() -> u64 {
    30
}
fn default_download_timeout() -> u64 {
    30
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            enabled: default_server_enabled(),
            url: default_server_url(),
            media_url: default_media_url(),
            reconnect_delay_ms: default_reconnect_delay(),
            connect_timeout_secs: default_connect_timeout(),
            ping_interval_secs: default_ping_interval(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

// =============================================================================
// Startup Settings
// =============================================================================

/// How long each domain waits for fresh server data before falling back to
/// what is on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupSettings {
    #[serde(default = "default_configuration_timeout")]
    pub configuration_timeout_ms: u64,

    #[serde(default = "default_media_timeout")]
    pub media_timeout_ms: u64,
}

fn default_configuration_timeout() -> u64 {
    10_000
}
fn default_media_timeout() -> u64 {
    5_000
}

impl Default for StartupSettings {
    fn default() -> Self {
        StartupSettings {
            configuration_timeout_ms: default_configuration_timeout(),
            media_timeout_ms: default_media_timeout(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Periodic sync behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Interval between configuration re-fetches once startup is done.
    #[serde(default = "default_configuration_interval")]
    pub configuration_interval_secs: u64,
}

fn default_configuration_interval() -> u64 {
    300
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            configuration_interval_secs: default_configuration_interval(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Local directories for persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory holding `configuration.json`.
    #[serde(default = "default_configuration_dir")]
    pub configuration_dir: PathBuf,

    /// Directory holding downloaded media files.
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
}

fn default_configuration_dir() -> PathBuf {
    PathBuf::from("/usr/share/bee/configuration")
}
fn default_media_dir() -> PathBuf {
    PathBuf::from("/usr/share/bee/media")
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            configuration_dir: default_configuration_dir(),
            media_dir: default_media_dir(),
        }
    }
}

// =============================================================================
// Media Settings
// =============================================================================

/// Media validity rules and fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSettings {
    /// Files smaller than this are never modelled or deleted.
    #[serde(default = "default_min_file_size")]
    pub min_file_size: u64,

    /// URI returned by `media_path` when the requested file is unusable.
    #[serde(default = "default_media")]
    pub default_media: String,
}

fn default_min_file_size() -> u64 {
    bee_core::media::MIN_MEDIA_FILE_SIZE
}
fn default_media() -> String {
    "qrc:/media/default.gif".to_string()
}

impl Default for MediaSettings {
    fn default() -> Self {
        MediaSettings {
            min_file_size: default_min_file_size(),
            default_media: default_media(),
        }
    }
}

// =============================================================================
// Network Settings
// =============================================================================

/// Which interface gates connection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Interface whose IFF_UP flag is watched.
    #[serde(default = "default_interface")]
    pub interface: String,

    /// How often the interface flags are polled (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_interface() -> String {
    "lo".to_string()
}
fn default_poll_interval() -> u64 {
    30
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            interface: default_interface(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub startup: StartupSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub media: MediaSettings,

    #[serde(default)]
    pub network: NetworkSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (agent.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::ConfigLoadFailed(format!("{}: {e}", path.display())))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        validate_url(&self.server.url, &["ws", "wss"], "Server URL")?;
        validate_url(&self.server.media_url, &["http", "https"], "Media URL")?;

        let positive = [
            ("server.reconnect_delay_ms", self.server.reconnect_delay_ms),
            ("server.connect_timeout_secs", self.server.connect_timeout_secs),
            ("server.ping_interval_secs", self.server.ping_interval_secs),
            ("server.download_timeout_secs", self.server.download_timeout_secs),
            ("startup.configuration_timeout_ms", self.startup.configuration_timeout_ms),
            ("startup.media_timeout_ms", self.startup.media_timeout_ms),
            ("sync.configuration_interval_secs", self.sync.configuration_interval_secs),
            ("network.poll_interval_secs", self.network.poll_interval_secs),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(SyncError::InvalidConfig(format!(
                "{name} must be greater than 0"
            )));
        }

        if self.network.interface.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "network.interface must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("BEE_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(name) = std::env::var("BEE_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(enabled) = std::env::var("BEE_SERVER_ENABLED") {
            match enabled.parse::<bool>() {
                Ok(enabled) => self.server.enabled = enabled,
                Err(_) => warn!(value = %enabled, "Ignoring invalid BEE_SERVER_ENABLED"),
            }
        }

        if let Ok(url) = std::env::var("BEE_SERVER_URL") {
            debug!(url = %url, "Overriding server URL from environment");
            self.server.url = url;
        }

        if let Ok(url) = std::env::var("BEE_MEDIA_URL") {
            debug!(url = %url, "Overriding media URL from environment");
            self.server.media_url = url;
        }

        if let Ok(delay) = std::env::var("BEE_RECONNECT_DELAY_MS") {
            match delay.parse::<u64>() {
                Ok(ms) => self.server.reconnect_delay_ms = ms,
                Err(_) => warn!(value = %delay, "Ignoring invalid BEE_RECONNECT_DELAY_MS"),
            }
        }

        if let Ok(dir) = std::env::var("BEE_CONFIGURATION_DIR") {
            self.storage.configuration_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("BEE_MEDIA_DIR") {
            self.storage.media_dir = PathBuf::from(dir);
        }

        if let Ok(iface) = std::env::var("BEE_NETWORK_INTERFACE") {
            self.network.interface = iface;
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "bee", "bee-agent")
            .map(|dirs| dirs.config_dir().join("agent.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn server_url(&self) -> &str {
        &self.server.url
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.server.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.server.connect_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.server.ping_interval_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.server.download_timeout_secs)
    }

    pub fn configuration_timeout(&self) -> Duration {
        Duration::from_millis(self.startup.configuration_timeout_ms)
    }

    pub fn media_timeout(&self) -> Duration {
        Duration::from_millis(self.startup.media_timeout_ms)
    }

    pub fn configuration_interval(&self) -> Duration {
        Duration::from_secs(self.sync.configuration_interval_secs)
    }

    pub fn link_poll_interval(&self) -> Duration {
        Duration::from_secs(self.network.poll_interval_secs)
    }
}

/// Checks that `raw` parses and uses one of the allowed schemes.
pub fn validate_url(raw: &str, schemes: &[&str], what: &str) -> SyncResult<Url> {
    let url = Url::parse(raw).map_err(|e| SyncError::InvalidUrl(format!("{what} {raw}: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(SyncError::InvalidUrl(format!(
            "{what} must use one of {schemes:?}, got: {raw}"
        )));
    }
    Ok(url)
}
