//! Configuration types for relayfs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::mount::MountOptions;
use crate::error::{RelayError, Result};

/// Log level for the relay process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only log errors
    Error,
    /// Log errors and warnings
    Warn,
    /// Log errors, warnings, and informational messages
    Info,
    /// Log errors, warnings, info, and debug messages
    Debug,
    /// Log everything including every relayed operation
    Trace,
}

impl LogLevel {
    /// Returns the string representation of the log level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// Optional operation families.
///
/// A family answers requests only when this build carries it and the
/// configuration leaves it on; otherwise it reports "not supported".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Extended attributes
    pub xattr: bool,
    /// Byte-range (POSIX) locks
    pub posix_locks: bool,
    /// Space preallocation
    pub fallocate: bool,
}

impl Capabilities {
    /// What this build can back on this host.
    pub fn supported() -> Self {
        Self {
            xattr: cfg!(all(feature = "xattr", target_os = "linux")),
            posix_locks: cfg!(all(feature = "posix-locks", target_os = "linux")),
            fallocate: cfg!(all(feature = "fallocate", target_os = "linux")),
        }
    }

    pub fn none() -> Self {
        Self {
            xattr: false,
            posix_locks: false,
            fallocate: false,
        }
    }

    /// Families enabled in both `self` and `other`.
    pub fn intersect(self, other: Self) -> Self {
        Self {
            xattr: self.xattr && other.xattr,
            posix_locks: self.posix_locks && other.posix_locks,
            fallocate: self.fallocate && other.fallocate,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::supported()
    }
}

/// Process-wide configuration, optionally loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Logging level
    pub log_level: LogLevel,

    /// Optional operation families to serve
    pub capabilities: Capabilities,

    /// Override for the resolved-path limit (None = host `PATH_MAX`)
    pub max_path_length: Option<usize>,

    /// Options handed to the bridge at mount time
    pub mount: MountOptions,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            capabilities: Capabilities::default(),
            max_path_length: None,
            mount: MountOptions::default(),
        }
    }
}

impl RelayConfig {
    /// Creates a new RelayConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a config suitable for development/testing.
    pub fn development() -> Self {
        Self {
            log_level: LogLevel::Debug,
            ..Self::default()
        }
    }

    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RelayError::InvalidArgument(format!("invalid configuration: {}", e)))
    }

    /// Reads and parses a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| RelayError::InvalidArgument(format!("unserializable configuration: {}", e)))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Some(max) = self.max_path_length {
            if max < 2 {
                errors.push(format!("max_path_length must be at least 2, got {}", max));
            }
            if max > crate::types::DEFAULT_MAX_PATH {
                errors.push(format!(
                    "max_path_length {} exceeds the host limit {}",
                    max,
                    crate::types::DEFAULT_MAX_PATH
                ));
            }
        }

        let wanted = self.capabilities;
        let supported = Capabilities::supported();
        if wanted.xattr && !supported.xattr {
            errors.push("extended attributes are not available in this build".to_string());
        }
        if wanted.posix_locks && !supported.posix_locks {
            errors.push("byte-range locks are not available in this build".to_string());
        }
        if wanted.fallocate && !supported.fallocate {
            errors.push("fallocate is not available in this build".to_string());
        }

        if let Some(name) = &self.mount.fs_name {
            if name.is_empty() || name.contains(',') {
                errors.push(format!("fs_name must be non-empty and free of commas: {:?}", name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Debug.to_string(), "debug");
        assert!(LogLevel::Error < LogLevel::Trace);
    }

    #[test]
    fn test_default_capabilities_match_build() {
        assert_eq!(RelayConfig::default().capabilities, Capabilities::supported());
        assert_eq!(
            Capabilities::supported().intersect(Capabilities::none()),
            Capabilities::none()
        );
    }

    #[test]
    fn test_json_round_trip_with_defaults() {
        let config = RelayConfig::from_json(
            r#"{ "log_level": "debug", "capabilities": { "xattr": false }, "max_path_length": 512 }"#,
        )
        .unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(!config.capabilities.xattr);
        assert_eq!(config.capabilities.posix_locks, Capabilities::supported().posix_locks);
        assert_eq!(config.max_path_length, Some(512));

        let reparsed = RelayConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(reparsed.max_path_length, Some(512));
        assert!(!reparsed.capabilities.xattr);
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        let err = RelayConfig::from_json("{ not json").unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = RelayConfig::development();
        assert!(config.validate().is_ok());

        config.max_path_length = Some(1);
        config.mount.fs_name = Some("a,b".to_string());
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relayfs.json");
        std::fs::write(&path, r#"{ "log_level": "trace" }"#).unwrap();
        assert_eq!(RelayConfig::load(&path).unwrap().log_level, LogLevel::Trace);
        assert_eq!(
            RelayConfig::load(&dir.path().join("missing.json")).unwrap_err(),
            RelayError::NotFound
        );
    }
}
