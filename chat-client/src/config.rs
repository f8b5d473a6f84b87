//! Configuration loading for chatsync-client.
//!
//! Configuration is loaded from a TOML file. Every section and key is
//! optional; missing values take their defaults.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use chatsync_core::ResyncPolicy;

/// Root configuration for the sync engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Typing presence configuration.
    #[serde(default)]
    pub typing: TypingConfig,
    /// Resync configuration.
    #[serde(default)]
    pub resync: ResyncConfig,
    /// Attachment storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Change feed configuration.
    #[serde(default)]
    pub feed: FeedConfig,
}

/// Typing presence configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TypingConfig {
    /// Liveness window in milliseconds (default: 4000).
    #[serde(default = "default_typing_window_ms")]
    pub window_ms: u64,
    /// Maximum tracked `(chat, user)` pairs (default: 256).
    #[serde(default = "default_typing_capacity")]
    pub capacity: usize,
}

/// Resync configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResyncConfig {
    /// Attempts before the selection enters the error state (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds (default: 500).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Attachment storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
    /// Bucket attachments are uploaded to (default: "chat-files").
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

/// Change feed configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedConfig {
    /// Undelivered items buffered per subscription (default: 256).
    #[serde(default = "default_feed_buffer")]
    pub buffer: usize,
}

// Default value functions
fn default_typing_window_ms() -> u64 {
    4000
}

fn default_typing_capacity() -> usize {
    256
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_bucket() -> String {
    "chat-files".to_string()
}

fn default_feed_buffer() -> usize {
    256
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            window_ms: default_typing_window_ms(),
            capacity: default_typing_capacity(),
        }
    }
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            buffer: default_feed_buffer(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a value
    /// is out of range.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.typing.window_ms == 0 {
            return Err(ConfigError::Invalid("typing.window_ms must be > 0".into()));
        }
        if self.typing.capacity == 0 {
            return Err(ConfigError::Invalid("typing.capacity must be > 0".into()));
        }
        if self.resync.max_attempts == 0 {
            return Err(ConfigError::Invalid("resync.max_attempts must be > 0".into()));
        }
        if self.resync.base_delay_ms > self.resync.max_delay_ms {
            return Err(ConfigError::Invalid(
                "resync.base_delay_ms must not exceed resync.max_delay_ms".into(),
            ));
        }
        if self.storage.bucket.trim().is_empty() {
            return Err(ConfigError::Invalid("storage.bucket must not be empty".into()));
        }
        if self.feed.buffer == 0 {
            return Err(ConfigError::Invalid("feed.buffer must be > 0".into()));
        }
        Ok(())
    }

    /// Typing liveness window.
    pub fn typing_window(&self) -> Duration {
        Duration::from_millis(self.typing.window_ms)
    }

    /// Retry policy for resyncs.
    pub fn resync_policy(&self) -> ResyncPolicy {
        ResyncPolicy {
            max_attempts: self.resync.max_attempts,
            base_delay: Duration::from_millis(self.resync.base_delay_ms),
            max_delay: Duration::from_millis(self.resync.max_delay_ms),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.typing.window_ms, 4000);
        assert_eq!(config.storage.bucket, "chat-files");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[typing]
window_ms = 2500
capacity = 64

[resync]
max_attempts = 3
base_delay_ms = 100

[storage]
bucket = "attachments"

[feed]
buffer = 32
"#;

        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.typing_window(), Duration::from_millis(2500));
        assert_eq!(config.typing.capacity, 64);
        assert_eq!(config.resync.max_attempts, 3);
        assert_eq!(config.resync.max_delay_ms, 30_000);
        assert_eq!(config.storage.bucket, "attachments");
        assert_eq!(config.feed.buffer, 32);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn resync_policy_maps_durations() {
        let policy = EngineConfig::default().resync_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[typing]\nwindow_ms = 1000").unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.typing.window_ms, 1000);
    }

    #[test]
    fn from_file_rejects_out_of_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[feed]\nbuffer = 0").unwrap();

        let result = EngineConfig::from_file(file.path());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn from_file_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[typing]\nwindow_ms = \"soon\"").unwrap();

        let result = EngineConfig::from_file(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn missing_file_is_read_error() {
        let result = EngineConfig::from_file(std::path::Path::new("/nonexistent/chatsync.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }
}
