//! # Sync Configuration
//!
//! Configuration management for the sync coordinator.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_REMOTE_URL=https://sync.example.com                          │
//! │     TALLY_DEVICE_ID=abc-123                                            │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/pos/sync.toml (Linux)                                    │
//! │     ~/Library/Application Support/com.tally.pos/sync.toml (macOS)      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     auto-generated device_id, no remote                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Register 1"
//!
//! [remote]
//! base_url = "https://sync.example.com/api"
//!
//! [sync]
//! batch_size = 100
//! poll_interval_secs = 30
//! max_concurrency = 4
//! max_attempts = 10
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Register 1", "Back Office").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "POS Terminal".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Remote Configuration
// =============================================================================

/// Where the authoritative store lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the sync API; the coordinator posts to `{base_url}/sync`.
    /// No remote means the device stays offline.
    #[serde(default)]
    pub base_url: Option<String>,
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Queue entries dequeued per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Interval between background cycles while online (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Per-call timeout for remote requests (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Pushes in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Initial backoff duration (milliseconds) after a failed cycle.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Failed attempts after which an entry is parked and its record marked
    /// failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff randomization factor (0.0 - 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_batch_size() -> u32 {
    100
}
fn default_poll_interval() -> u64 {
    30
}
fn default_request_timeout() -> u64 {
    15
}
fn default_max_concurrency() -> usize {
    4
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    10
}
fn default_jitter() -> f64 {
    0.5
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval(),
            request_timeout_secs: default_request_timeout(),
            max_concurrency: default_max_concurrency(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Device-specific configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Remote store location.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Sync behavior settings.
    #[serde(default)]
    pub sync: SyncSettings,
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
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        // Try to load from config file
        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        // Override with environment variables
        config.apply_env_overrides();

        // Validate the configuration
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

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if let Some(raw) = &self.remote.base_url {
            let url = Url::parse(raw)?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(SyncError::InvalidUrl(format!(
                    "Remote URL must start with http:// or https://, got: {}",
                    raw
                )));
            }
        }

        let sync = &self.sync;
        if sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }
        if sync.max_concurrency == 0 {
            return Err(SyncError::InvalidConfig(
                "max_concurrency must be greater than 0".into(),
            ));
        }
        if sync.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_attempts must be greater than 0".into(),
            ));
        }
        if sync.poll_interval_secs == 0 || sync.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "poll_interval_secs and request_timeout_secs must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&sync.jitter) {
            return Err(SyncError::InvalidConfig(format!(
                "jitter must be between 0.0 and 1.0, got {}",
                sync.jitter
            )));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        // Device ID
        if let Ok(id) = std::env::var("TALLY_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        // Device name
        if let Ok(name) = std::env::var("TALLY_DEVICE_NAME") {
            self.device.name = name;
        }

        // Remote URL
        if let Ok(url) = std::env::var("TALLY_REMOTE_URL") {
            debug!(url = %url, "Overriding remote URL from environment");
            self.remote.base_url = Some(url);
        }

        // Batch size
        if let Ok(size) = std::env::var("TALLY_SYNC_BATCH_SIZE") {
            match size.parse::<u32>() {
                Ok(n) => self.sync.batch_size = n,
                Err(_) => warn!(value = %size, "Ignoring invalid TALLY_SYNC_BATCH_SIZE"),
            }
        }

        // Poll interval
        if let Ok(secs) = std::env::var("TALLY_SYNC_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(n) => self.sync.poll_interval_secs = n,
                Err(_) => warn!(value = %secs, "Ignoring invalid TALLY_SYNC_INTERVAL_SECS"),
            }
        }

        // Retry budget
        if let Ok(attempts) = std::env::var("TALLY_SYNC_MAX_ATTEMPTS") {
            match attempts.parse::<u32>() {
                Ok(n) => self.sync.max_attempts = n,
                Err(_) => warn!(value = %attempts, "Ignoring invalid TALLY_SYNC_MAX_ATTEMPTS"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "pos").map(|dirs| {
            let config_dir = dirs.config_dir();
            config_dir.join("sync.toml")
        })
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the remote base URL if configured.
    pub fn remote_url(&self) -> Option<&str> {
        self.remote.base_url.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty()); // Auto-generated
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.sync.max_concurrency, 4);
        assert_eq!(config.sync.max_attempts, 10);
        assert!(config.remote_url().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        // Empty device ID should fail
        config.device.id = String::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingDeviceId)));

        // Non-HTTP URL should fail
        config.device.id = "test".to_string();
        config.remote.base_url = Some("ws://localhost:8080".to_string());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        // Unparseable URL should fail
        config.remote.base_url = Some("not a url".to_string());
        assert!(config.validate().unwrap_err().is_config_error());

        config.remote.base_url = Some("https://sync.example.com/api".to_string());
        assert!(config.validate().is_ok());

        config.sync.max_concurrency = 0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [device]
            id = "register-1"

            [sync]
            batch_size = 25
            "#,
        )
        .unwrap();

        assert_eq!(config.device.id, "register-1");
        assert_eq!(config.device.name, "POS Terminal");
        assert_eq!(config.sync.batch_size, 25);
        assert_eq!(config.sync.poll_interval_secs, 30);
        assert!(config.remote.base_url.is_none());
    }

    #[test]
    fn test_toml_serialization() {
        let mut config = SyncConfig::default();
        config.remote.base_url = Some("https://sync.example.com".into());

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[device]"));
        assert!(toml_str.contains("[remote]"));
        assert!(toml_str.contains("[sync]"));
    }

    #[test]
    fn test_save_and_load_round_trip_file() {
        let path = std::env::temp_dir().join(format!("tally-sync-{}.toml", Uuid::new_v4()));

        let mut config = SyncConfig::default();
        config.device.name = "Back Office".into();
        config.sync.max_attempts = 3;
        config.save(Some(path.clone())).unwrap();

        let loaded = SyncConfig::load(Some(path.clone())).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded.device.name, "Back Office");
        assert_eq!(loaded.sync.max_attempts, 3);
    }
}
