//! # Configuration Management
//!
//! Centralized configuration for transports, dispatchers, writer pools and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - TOML strings via `from_toml()`
//! - Environment variables (`BLITNET_*`) via `from_env()`
//! - Direct instantiation with defaults and `default_with_overrides()`
//!
//! ## Example
//! ```rust
//! use blitnet::config::NetworkConfig;
//! use blitnet::protocol::dispatcher::HandlerIdEncoding;
//!
//! let config = NetworkConfig::from_toml(r#"
//!     [transport]
//!     address = "127.0.0.1:7777"
//!     frame_size_limit = 1200
//!
//!     [dispatcher]
//!     handler_ids = "stable_hash"
//! "#).unwrap();
//!
//! assert_eq!(config.transport.frame_size_limit, 1200);
//! assert_eq!(config.dispatcher.handler_ids, HandlerIdEncoding::StableHash);
//! assert!(config.validate().is_empty());
//! ```

use crate::core::writer::DEFAULT_WRITER_CAPACITY;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::HandlerIdEncoding;
use crate::utils::buffer_pool::DEFAULT_MAX_POOLED_CAPACITY;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::Level;

/// Default batch threshold for stream transports
pub const DEFAULT_FRAME_SIZE_LIMIT: u32 = 1024;

/// Smallest accepted frame size limit
pub const MIN_FRAME_SIZE_LIMIT: u32 = 64;

/// Largest accepted frame size limit (16 MB)
pub const MAX_FRAME_SIZE_LIMIT: u32 = 16 * 1024 * 1024;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    ///
    /// Unset variables keep their defaults. Variables that fail to parse are
    /// reported as errors instead of being ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BLITNET_ADDRESS") {
            config.transport.address = addr;
        }

        if let Some(limit) = parse_env::<u32>("BLITNET_FRAME_SIZE_LIMIT")? {
            config.transport.frame_size_limit = limit;
        }

        if let Ok(ids) = std::env::var("BLITNET_HANDLER_IDS") {
            config.dispatcher.handler_ids = match ids.as_str() {
                "name" => HandlerIdEncoding::Name,
                "stable_hash" => HandlerIdEncoding::StableHash,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Invalid BLITNET_HANDLER_IDS: '{other}' (expected 'name' or 'stable_hash')"
                    )))
                }
            };
        }

        if let Some(record) = parse_env::<bool>("BLITNET_RECORD_DIAGNOSTICS")? {
            config.dispatcher.record_diagnostics = record;
        }

        if let Some(count) = parse_env::<usize>("BLITNET_PREALLOCATED_WRITERS")? {
            config.pool.preallocated_writers = count;
        }

        if let Ok(level) = std::env::var("BLITNET_LOG_LEVEL") {
            config.logging.log_level = level.parse::<Level>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid BLITNET_LOG_LEVEL: '{level}'"))
            })?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.transport.validate());
        errors.extend(self.pool.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid {name}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Listen address for servers, target address for clients
    pub address: String,

    /// Largest batch a transport write may carry, header included
    pub frame_size_limit: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:7777"),
            frame_size_limit: DEFAULT_FRAME_SIZE_LIMIT,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Transport address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid transport address format: '{}' (expected format: '127.0.0.1:7777')",
                self.address
            ));
        }

        if self.frame_size_limit < MIN_FRAME_SIZE_LIMIT {
            errors.push(format!(
                "Frame size limit too small: {} bytes (minimum: {MIN_FRAME_SIZE_LIMIT})",
                self.frame_size_limit
            ));
        } else if self.frame_size_limit > MAX_FRAME_SIZE_LIMIT {
            errors.push(format!(
                "Frame size limit too large: {} bytes (maximum: 16 MB)",
                self.frame_size_limit
            ));
        }

        errors
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// How handler ids are written in front of each sub-message
    pub handler_ids: HandlerIdEncoding,

    /// Record per-handler sent/handled byte counts
    pub record_diagnostics: bool,
}

/// Writer pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Writers allocated up front
    pub preallocated_writers: usize,

    /// Initial capacity of each writer in bytes
    pub writer_capacity: usize,

    /// Writers that grew beyond this are freed instead of pooled
    pub max_pooled_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            preallocated_writers: 16,
            writer_capacity: DEFAULT_WRITER_CAPACITY,
            max_pooled_capacity: DEFAULT_MAX_POOLED_CAPACITY,
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.writer_capacity == 0 {
            errors.push("Writer capacity must be greater than 0".to_string());
        }

        if self.max_pooled_capacity < self.writer_capacity {
            errors.push(format!(
                "Max pooled capacity ({}) cannot be smaller than writer capacity ({})",
                self.max_pooled_capacity, self.writer_capacity
            ));
        }

        if self.preallocated_writers > 65_536 {
            errors.push(format!(
                "Preallocated writers very high: {} (maximum: 65536)",
                self.preallocated_writers
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("blitnet"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
        assert_eq!(config.transport.frame_size_limit, 1024);
        assert_eq!(config.dispatcher.handler_ids, HandlerIdEncoding::Name);
        assert!(!config.dispatcher.record_diagnostics);
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let config = NetworkConfig::from_toml(
            r#"
            [pool]
            preallocated_writers = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.preallocated_writers, 4);
        assert_eq!(config.pool.writer_capacity, DEFAULT_WRITER_CAPACITY);
        assert_eq!(config.transport.frame_size_limit, DEFAULT_FRAME_SIZE_LIMIT);
    }

    #[test]
    fn test_frame_limit_bounds() {
        let small = NetworkConfig::default_with_overrides(|c| c.transport.frame_size_limit = 10);
        assert_eq!(small.validate().len(), 1);

        let large = NetworkConfig::default_with_overrides(|c| {
            c.transport.frame_size_limit = MAX_FRAME_SIZE_LIMIT + 1
        });
        assert!(large.validate_strict().is_err());
    }

    #[test]
    fn test_example_config_parses() {
        let text = NetworkConfig::example_config();
        let parsed = NetworkConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.transport.address, TransportConfig::default().address);
        assert_eq!(parsed.logging.log_level, Level::INFO);
    }
}
