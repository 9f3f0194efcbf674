//! Configuration management
//!
//! Environment- and file-based configuration with defaults and validation.
//! Every tunable the engine consults (stale timeout, epoch retention,
//! recovery debounce, key package lifetime) lives here so host processes
//! sharing one store can be configured identically.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::core_mls::types::GroupConfig;
use crate::logging::LogLevel;

/// Default cipher suite name advertised to the delivery service
pub const DEFAULT_CIPHER_SUITE: &str = "MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Persistent store configuration
    pub store: StoreConfig,

    /// Message ordering configuration
    pub sequencing: SequencingConfig,

    /// Failure recovery configuration
    pub recovery: RecoveryConfig,

    /// Key package publishing configuration
    pub key_packages: KeyPackageConfig,

    /// Server synchronisation configuration
    pub sync: SyncConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the shared database
    pub data_dir: PathBuf,

    /// Database file name inside `data_dir`
    pub database_file: String,

    /// Connection pool size per process
    pub pool_size: u32,

    /// How long a writer waits on a lock held by a sibling process
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
}

/// Sequencing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencingConfig {
    /// Buffered messages older than this are dropped by cleanup
    #[serde(with = "humantime_serde")]
    pub stale_timeout: Duration,

    /// Largest accepted gap ahead of the last processed sequence number
    pub max_forward_distance: u64,
}

/// Recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Number of past epochs whose messages are still accepted
    pub max_past_epochs: u64,

    /// Minimum interval between two automatic rejoin requests
    #[serde(with = "humantime_serde")]
    pub debounce_interval: Duration,

    /// Consecutive failures before an automatic rejoin is requested
    pub failure_threshold: u32,
}

/// Key package configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPackageConfig {
    /// Lifetime of a freshly published key package
    #[serde(with = "humantime_serde")]
    pub lifetime: Duration,

    /// Republish when the current package expires within this window
    #[serde(with = "humantime_serde")]
    pub refresh_window: Duration,

    /// Cipher suite name
    pub cipher_suite: String,
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Conversations requested per page
    pub page_size: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,

    /// Extra `EnvFilter` directives, e.g. `mlsync_core::core_mls::sequencer=debug`
    #[serde(default)]
    pub directives: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_file: "mlsync.db".to_string(),
            pool_size: 16,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for SequencingConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(300),
            max_forward_distance: 2000,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_past_epochs: 5,
            debounce_interval: Duration::from_secs(60),
            failure_threshold: 3,
        }
    }
}

impl Default for KeyPackageConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(30 * 24 * 3600),
            refresh_window: Duration::from_secs(7 * 24 * 3600),
            cipher_suite: DEFAULT_CIPHER_SUITE.to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { page_size: 50 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
            directives: Vec::new(),
        }
    }
}

impl StoreConfig {
    /// Full path of the shared database file
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnv {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn parse_env_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_env::<u64>(key)?.map(Duration::from_secs))
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: MLSYNC_<SECTION>_<KEY>
    /// Example: MLSYNC_RECOVERY_MAX_PAST_EPOCHS=8. Durations are whole seconds.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(dir) = env::var("MLSYNC_STORE_DATA_DIR") {
            config.store.data_dir = PathBuf::from(dir);
        }
        if let Ok(file) = env::var("MLSYNC_STORE_DATABASE_FILE") {
            config.store.database_file = file;
        }
        if let Some(size) = parse_env("MLSYNC_STORE_POOL_SIZE")? {
            config.store.pool_size = size;
        }
        if let Some(timeout) = parse_env_secs("MLSYNC_STORE_BUSY_TIMEOUT")? {
            config.store.busy_timeout = timeout;
        }

        if let Some(timeout) = parse_env_secs("MLSYNC_SEQUENCING_STALE_TIMEOUT")? {
            config.sequencing.stale_timeout = timeout;
        }
        if let Some(distance) = parse_env("MLSYNC_SEQUENCING_MAX_FORWARD_DISTANCE")? {
            config.sequencing.max_forward_distance = distance;
        }

        if let Some(epochs) = parse_env("MLSYNC_RECOVERY_MAX_PAST_EPOCHS")? {
            config.recovery.max_past_epochs = epochs;
        }
        if let Some(interval) = parse_env_secs("MLSYNC_RECOVERY_DEBOUNCE_INTERVAL")? {
            config.recovery.debounce_interval = interval;
        }
        if let Some(threshold) = parse_env("MLSYNC_RECOVERY_FAILURE_THRESHOLD")? {
            config.recovery.failure_threshold = threshold;
        }

        if let Some(lifetime) = parse_env_secs("MLSYNC_KEY_PACKAGES_LIFETIME")? {
            config.key_packages.lifetime = lifetime;
        }
        if let Some(window) = parse_env_secs("MLSYNC_KEY_PACKAGES_REFRESH_WINDOW")? {
            config.key_packages.refresh_window = window;
        }

        if let Some(page_size) = parse_env("MLSYNC_SYNC_PAGE_SIZE")? {
            config.sync.page_size = page_size;
        }

        if let Ok(level) = env::var("MLSYNC_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(json) = parse_env("MLSYNC_LOG_JSON")? {
            config.logging.json_format = json;
        }
        if let Ok(directives) = env::var("MLSYNC_LOG_DIRECTIVES") {
            config.logging.directives = directives
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.pool_size == 0 {
            return Err(ConfigError::invalid("store.pool_size", "must be at least 1"));
        }
        if self.sequencing.max_forward_distance == 0 {
            return Err(ConfigError::invalid(
                "sequencing.max_forward_distance",
                "must be at least 1",
            ));
        }
        if self.recovery.max_past_epochs == 0 {
            return Err(ConfigError::invalid("recovery.max_past_epochs", "must be at least 1"));
        }
        if self.recovery.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "recovery.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.key_packages.refresh_window >= self.key_packages.lifetime {
            return Err(ConfigError::invalid(
                "key_packages.refresh_window",
                format!(
                    "{:?} is not shorter than the lifetime {:?}",
                    self.key_packages.refresh_window, self.key_packages.lifetime
                ),
            ));
        }
        if self.sync.page_size == 0 {
            return Err(ConfigError::invalid("sync.page_size", "must be at least 1"));
        }
        if self.logging.level.parse::<LogLevel>().is_err() {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("unknown level '{}'", self.logging.level),
            ));
        }
        Ok(())
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Group parameters handed to the crypto engine on create/join
    pub fn group_config(&self) -> GroupConfig {
        GroupConfig {
            max_past_epochs: self.recovery.max_past_epochs,
            maximum_forward_distance: self.sequencing.max_forward_distance,
            ..GroupConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sequencing.stale_timeout, Duration::from_secs(300));
        assert_eq!(config.recovery.debounce_interval, Duration::from_secs(60));
        assert_eq!(config.recovery.max_past_epochs, 5);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.store.pool_size = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.recovery.max_past_epochs = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.key_packages.refresh_window = config.key_packages.lifetime;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "logging.level",
                ..
            })
        ));

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mlsync.toml");

        let mut config = Config::default();
        config.recovery.failure_threshold = 7;
        config.sequencing.stale_timeout = Duration::from_secs(90);
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.recovery.failure_threshold, 7);
        assert_eq!(loaded.sequencing.stale_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        match Config::from_file(&path) {
            Err(ConfigError::Io { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_env_values_parse_into_target_type() {
        env::set_var("MLSYNC_TEST_PARSE_OK", "42");
        env::set_var("MLSYNC_TEST_PARSE_BAD", "forty-two");

        assert_eq!(parse_env::<u32>("MLSYNC_TEST_PARSE_OK").unwrap(), Some(42));
        assert_eq!(parse_env::<u32>("MLSYNC_TEST_PARSE_UNSET").unwrap(), None);
        assert!(matches!(
            parse_env::<u32>("MLSYNC_TEST_PARSE_BAD"),
            Err(ConfigError::InvalidEnv { key, .. }) if key == "MLSYNC_TEST_PARSE_BAD"
        ));
        assert_eq!(
            parse_env_secs("MLSYNC_TEST_PARSE_OK").unwrap(),
            Some(Duration::from_secs(42))
        );

        env::remove_var("MLSYNC_TEST_PARSE_OK");
        env::remove_var("MLSYNC_TEST_PARSE_BAD");
    }

    #[test]
    fn test_group_config_follows_recovery_settings() {
        let mut config = Config::default();
        config.recovery.max_past_epochs = 9;
        assert_eq!(config.group_config().max_past_epochs, 9);
        assert_eq!(config.group_config().maximum_forward_distance, 2000);
    }
}
