//! Session configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::options::ScanOptions;

/// Largest accepted per-channel event buffer.
pub const MAX_EVENT_CAPACITY: usize = 65_536;

/// Longest accepted timeout, in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Central session configuration.
///
/// Every field has a default, so an empty TOML document is a valid
/// configuration.
///
/// ```
/// use bleplex_core::SessionConfig;
///
/// let config: SessionConfig = toml::from_str("connect_timeout_secs = 10").unwrap();
/// assert_eq!(config.event_capacity, 256);
/// config.validate().expect("valid");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Buffer size of each event bus channel. Slow subscribers that fall
    /// further behind skip events.
    pub event_capacity: usize,
    /// Default connect timeout. `None` waits indefinitely.
    pub connect_timeout_secs: Option<u64>,
    /// Per-caller timeout for discovery, read and write operations.
    pub operation_timeout_secs: Option<u64>,
    /// Defaults for [`CentralSession::scan_configured`](crate::CentralSession::scan_configured).
    pub scan: ScanConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            connect_timeout_secs: None,
            operation_timeout_secs: None,
            scan: ScanConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// This checks:
    /// - `event_capacity` is between 1 and [`MAX_EVENT_CAPACITY`]
    /// - timeouts, when set, are between 1 second and [`MAX_TIMEOUT_SECS`]
    /// - scan services are not nil and not repeated
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.event_capacity == 0 || self.event_capacity > MAX_EVENT_CAPACITY {
            errors.push(ValidationError {
                field: "event_capacity".to_string(),
                message: format!(
                    "must be between 1 and {}, got {}",
                    MAX_EVENT_CAPACITY, self.event_capacity
                ),
            });
        }

        for (field, value) in [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("operation_timeout_secs", self.operation_timeout_secs),
        ] {
            if let Some(secs) = value
                && (secs == 0 || secs > MAX_TIMEOUT_SECS)
            {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: format!("must be between 1 and {} seconds, got {}", MAX_TIMEOUT_SECS, secs),
                });
            }
        }

        errors.extend(self.scan.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Set the event bus capacity.
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the default connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Set the per-caller operation timeout.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Default connect timeout.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    /// Per-caller operation timeout.
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }
}

/// Scan defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Report repeated advertisements from the same device.
    pub allow_duplicates: bool,
    /// Only report devices advertising one of these services. Empty means all.
    pub services: Vec<Uuid>,
}

impl ScanConfig {
    /// Validate scan configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (i, uuid) in self.services.iter().enumerate() {
            if uuid.is_nil() {
                errors.push(ValidationError {
                    field: format!("scan.services[{}]", i),
                    message: "service UUID cannot be nil".to_string(),
                });
            } else if !seen.insert(*uuid) {
                errors.push(ValidationError {
                    field: format!("scan.services[{}]", i),
                    message: format!("duplicate service UUID '{}'", uuid),
                });
            }
        }
        errors
    }

    /// Scan options matching this configuration.
    pub fn options(&self) -> ScanOptions {
        ScanOptions::new().allow_duplicates(self.allow_duplicates)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `event_capacity` or `scan.services[0]`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.connect_timeout(), None);
        assert!(config.scan.services.is_empty());
        config.validate().expect("default config should be valid");
    }

    #[test]
    fn test_config_full_toml() {
        let toml = r#"
            event_capacity = 64
            connect_timeout_secs = 10
            operation_timeout_secs = 5

            [scan]
            allow_duplicates = true
            services = ["0000180f-0000-1000-8000-00805f9b34fb"]
        "#;
        let config: SessionConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.event_capacity, 64);
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.operation_timeout(), Some(Duration::from_secs(5)));
        assert!(config.scan.allow_duplicates);
        assert_eq!(config.scan.services, vec![bleplex_types::uuids::BATTERY_SERVICE]);
        assert!(config.scan.options().allow_duplicates);
    }

    #[test]
    fn test_config_load_and_validate() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("bleplex.toml");
        std::fs::write(&path, "event_capacity = 32\n").unwrap();

        let config = SessionConfig::load_validated(&path).unwrap();
        assert_eq!(config.event_capacity, 32);
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = SessionConfig::load("/nonexistent/path/bleplex.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("invalid.toml");
        std::fs::write(&path, "this is not valid { toml").unwrap();

        let result = SessionConfig::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validation_collects_every_field() {
        let config = SessionConfig {
            event_capacity: 0,
            connect_timeout_secs: Some(0),
            operation_timeout_secs: Some(MAX_TIMEOUT_SECS + 1),
            scan: ScanConfig {
                allow_duplicates: false,
                services: vec![Uuid::nil(), Uuid::from_u128(7), Uuid::from_u128(7)],
            },
        };
        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "event_capacity",
                "connect_timeout_secs",
                "operation_timeout_secs",
                "scan.services[0]",
                "scan.services[2]",
            ]
        );
    }

    #[test]
    fn test_validation_error_display() {
        let err = ConfigError::Validation(vec![ValidationError {
            field: "event_capacity".to_string(),
            message: "must be between 1 and 65536, got 0".to_string(),
        }]);
        assert_eq!(
            err.to_string(),
            "Configuration validation failed:\n  - event_capacity: must be between 1 and 65536, got 0"
        );
    }

    #[test]
    fn test_builder_setters() {
        let config = SessionConfig::new()
            .with_event_capacity(16)
            .with_connect_timeout(Duration::from_secs(3))
            .with_operation_timeout(Duration::from_secs(2));
        assert_eq!(config.event_capacity, 16);
        assert_eq!(config.connect_timeout_secs, Some(3));
        assert_eq!(config.operation_timeout_secs, Some(2));
    }
}
