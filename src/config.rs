//! Runtime configuration.
//!
//! Loaded from a TOML file (every section optional, missing keys take their
//! defaults) and then overridden by environment variables:
//!
//! * `CTVAULT_TRANSFER_DIR` - root directory for received datasets
//! * `CTVAULT_MMAP_THRESHOLD` - raw size in bytes above which loads map the file

use crate::error::Result;
use crate::layout::DEFAULT_CHUNK_DIM;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Header layout written in front of `volume.bin`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeaderFormat {
    /// 36-byte header without bits per voxel
    Legacy,
    /// 40-byte header
    #[default]
    Extended,
    /// Raw chunk payloads only; shape comes from the sidecar
    None,
}

impl HeaderFormat {
    pub fn size(&self) -> usize {
        match self {
            HeaderFormat::Legacy => crate::format::LEGACY_HEADER_SIZE,
            HeaderFormat::Extended => crate::format::EXTENDED_HEADER_SIZE,
            HeaderFormat::None => 0,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub store: StoreConfig,
    pub retry: RetryPolicy,
    pub binning: BinningConfig,
    pub transfer: TransferConfig,
}

impl VaultConfig {
    /// Parse a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load from a file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading config");
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CTVAULT_TRANSFER_DIR") {
            self.transfer.base_dir = PathBuf::from(dir);
        }
        if let Ok(threshold) = std::env::var("CTVAULT_MMAP_THRESHOLD") {
            if let Ok(n) = threshold.parse() {
                self.store.mmap_threshold = n;
            }
        }
    }

    /// Pretty TOML of the defaults
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Chunk store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Chunk edge for newly built volumes
    pub chunk_dim: usize,
    /// Raw sizes above this many bytes are memory-mapped instead of read into RAM
    pub mmap_threshold: u64,
    /// Header written by `save`
    pub header_format: HeaderFormat,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_dim: DEFAULT_CHUNK_DIM,
            mmap_threshold: 2 * 1024 * 1024 * 1024,
            header_format: HeaderFormat::Extended,
        }
    }
}

/// Back-off used around mapping calls and the loader's one-shot retry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fixed delay before the loader retries a freshly written file
    pub loader_retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 50,
            max_delay_ms: 1_000,
            loader_retry_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms))
    }

    pub fn loader_retry_delay(&self) -> Duration {
        Duration::from_millis(self.loader_retry_delay_ms)
    }
}

/// Binning settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BinningConfig {
    /// Worker threads (None = rayon default)
    pub threads: Option<usize>,
}

/// Transfer service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Directory under which received datasets are created
    pub base_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("ctvault").join("datasets"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VaultConfig::default();
        assert_eq!(config.store.chunk_dim, 256);
        assert_eq!(config.store.header_format, HeaderFormat::Extended);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_partial_toml() {
        let config = VaultConfig::from_toml_str(
            r#"
            [store]
            chunk_dim = 128
            header_format = "legacy"

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.store.chunk_dim, 128);
        assert_eq!(config.store.header_format, HeaderFormat::Legacy);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_ms, 50);
        assert!(config.binning.threads.is_none());
    }

    #[test]
    fn test_default_toml_parses_back() {
        let text = VaultConfig::default_toml();
        let parsed = VaultConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.store.mmap_threshold, StoreConfig::default().mmap_threshold);
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(HeaderFormat::Legacy.size(), 36);
        assert_eq!(HeaderFormat::Extended.size(), 40);
        assert_eq!(HeaderFormat::None.size(), 0);
    }
}
