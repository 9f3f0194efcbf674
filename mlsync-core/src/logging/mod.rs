//! Logging subsystem
//!
//! All engine components log through `tracing` with structured fields
//! (`conversation_id`, `epoch`, `sequence_number`). This module wires up the
//! subscriber for host processes; library code never installs one on its own.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

use crate::config::LoggingConfig;

/// Subscriber settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    pub with_target: bool,
    /// One JSON object per event, for log shippers
    pub json_format: bool,
    /// Per-target overrides appended to the base level
    pub directives: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_target: true,
            json_format: false,
            directives: Vec::new(),
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }

    /// Add a filter directive such as `mlsync_core::core_mls::sequencer=trace`
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Base level followed by the per-target directives
    fn directive_string(&self) -> String {
        std::iter::once(self.level.as_str().to_string())
            .chain(self.directives.iter().cloned())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(self.directive_string())
            .map_err(|e| LoggingError::InvalidConfiguration(e.to_string()))
    }
}

impl TryFrom<&LoggingConfig> for LogConfig {
    type Error = LoggingError;

    fn try_from(config: &LoggingConfig) -> Result<Self, Self::Error> {
        let level = config.level.parse::<LogLevel>()?;
        Ok(LogConfig {
            level,
            with_target: config.with_target,
            json_format: config.json_format,
            directives: config.directives.clone(),
        })
    }
}

/// Install the global subscriber at `info`
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with_config(LogConfig::default())
}

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over `config.level` and the directives when
/// it is set. Fails if a subscriber is already installed.
///
/// # Example
/// ```no_run
/// use mlsync_core::logging::{init_logging_with_config, LogConfig, LogLevel};
///
/// let config = LogConfig::new(LogLevel::Warn)
///     .with_directive("mlsync_core::core_mls::sequencer=debug");
/// init_logging_with_config(config).expect("Failed to initialize logging");
/// ```
pub fn init_logging_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let registry = tracing_subscriber::registry().with(config.env_filter()?);

    let installed = if config.json_format {
        registry
            .with(fmt::layer().json().with_target(config.with_target))
            .try_init()
    } else {
        registry
            .with(fmt::layer().compact().with_target(config.with_target))
            .try_init()
    };
    installed.map_err(|e| LoggingError::InitializationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_string_appends_directives() {
        let config = LogConfig::new(LogLevel::Warn)
            .with_directive("mlsync_core::core_mls::sequencer=debug")
            .with_directive("r2d2=error");
        assert_eq!(
            config.directive_string(),
            "warn,mlsync_core::core_mls::sequencer=debug,r2d2=error"
        );
        assert_eq!(LogConfig::default().directive_string(), "info");
    }

    #[test]
    fn test_log_config_from_app_config() {
        let app = LoggingConfig {
            level: "warn".to_string(),
            json_format: true,
            with_target: false,
            directives: vec!["mlsync_core=trace".to_string()],
        };
        let config = LogConfig::try_from(&app).unwrap();
        assert_eq!(config.level, LogLevel::Warn);
        assert!(config.json_format);
        assert!(!config.with_target);
        assert_eq!(config.directives, app.directives);

        let bad = LoggingConfig {
            level: "loud".to_string(),
            ..app
        };
        assert!(LogConfig::try_from(&bad).is_err());
    }
}
