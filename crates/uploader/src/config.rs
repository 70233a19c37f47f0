//! Uploader configuration.
//!
//! Stored as TOML; every field is optional and falls back to its default.
//!
//! ```toml
//! chunk_size = 2097152
//! concurrency = 3
//! max_retries = 3
//! retry_delays_ms = [1000, 2000, 3000]
//! hash_concurrency = 4
//! progress_interval_ms = 500
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lowest accepted transfer concurrency.
pub const MIN_CONCURRENCY: usize = 2;
/// Highest accepted transfer concurrency.
pub const MAX_CONCURRENCY: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables for an [`Uploader`](crate::Uploader).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Bytes per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Concurrent chunk transfers, clamped to `[2, 5]`.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retries per chunk after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before retry `n` (0-based). The last entry repeats.
    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,

    /// Chunks read and hashed concurrently while preparing.
    #[serde(default = "default_hash_concurrency")]
    pub hash_concurrency: usize,

    /// Minimum gap between progress log lines in the CLI.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_chunk_size() -> u64 {
    chunkferry_transfer::DEFAULT_CHUNK_SIZE
}

fn default_concurrency() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delays_ms() -> Vec<u64> {
    vec![1000, 2000, 3000]
}

fn default_hash_concurrency() -> usize {
    4
}

fn default_progress_interval_ms() -> u64 {
    500
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_delays_ms: default_retry_delays_ms(),
            hash_concurrency: default_hash_concurrency(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl UploaderConfig {
    /// Loads configuration from `path`, or defaults if the file is missing.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: UploaderConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than zero".into()));
        }
        if self.retry_delays_ms.is_empty() {
            return Err(ConfigError::Invalid("retry_delays_ms must not be empty".into()));
        }
        Ok(())
    }

    /// Transfer concurrency after clamping.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }

    /// Hash parallelism, at least one.
    pub fn effective_hash_concurrency(&self) -> usize {
        self.hash_concurrency.max(1)
    }

    /// Backoff before retry number `retry` (0-based).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let ms = self
            .retry_delays_ms
            .get(retry as usize)
            .or(self.retry_delays_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config() {
        let config = UploaderConfig::default();
        assert_eq!(config.chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.effective_concurrency(), 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay(0), Duration::from_secs(1));
        assert_eq!(config.retry_delay(2), Duration::from_secs(3));
        config.validate().unwrap();
    }

    #[test]
    fn concurrency_is_clamped() {
        let mut config = UploaderConfig {
            concurrency: 0,
            ..UploaderConfig::default()
        };
        assert_eq!(config.effective_concurrency(), MIN_CONCURRENCY);
        config.concurrency = 64;
        assert_eq!(config.effective_concurrency(), MAX_CONCURRENCY);
    }

    #[test]
    fn last_retry_delay_repeats() {
        let config = UploaderConfig {
            retry_delays_ms: vec![10, 20],
            ..UploaderConfig::default()
        };
        assert_eq!(config.retry_delay(5), Duration::from_millis(20));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunkferry.toml");
        std::fs::write(&path, "chunk_size = 1024\nconcurrency = 4\n").unwrap();

        let config = UploaderConfig::load(&path).unwrap();
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.retry_delays_ms, vec![1000, 2000, 3000]);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = UploaderConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, UploaderConfig::default());
    }

    #[test]
    fn invalid_values_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "chunk_size = 0\n").unwrap();
        assert!(matches!(
            UploaderConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "retry_delays_ms = []\n").unwrap();
        assert!(matches!(
            UploaderConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = UploaderConfig {
            chunk_size: 4096,
            max_retries: 1,
            ..UploaderConfig::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: UploaderConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
