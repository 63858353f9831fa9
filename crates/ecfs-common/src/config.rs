//! Configuration types for ecfs
//!
//! The OSD binary loads these from a TOML file; every field has a default so
//! a partial (or missing) file yields a usable configuration.

use crate::error::{Error, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration of an OSD node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OsdConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl OsdConfig {
    /// Reject settings the storage engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.storage.max_open_files == 0 {
            return Err(Error::Configuration("max_open_files must be > 0".into()));
        }
        if self.transfer.chunk_size == 0 {
            return Err(Error::Configuration("chunk_size must be > 0".into()));
        }
        if self.transfer.distribution_workers == 0 || self.transfer.recovery_workers == 0 {
            return Err(Error::Configuration("worker pools must not be empty".into()));
        }
        Ok(())
    }
}

/// Node identity
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: NodeId,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
        }
    }
}

/// Storage locations and capacities
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding block and delta files
    #[serde(default = "default_block_dir")]
    pub block_dir: PathBuf,
    /// Directory holding cached segments
    #[serde(default = "default_segment_cache_dir")]
    pub segment_cache_dir: PathBuf,
    /// Byte budget of the block store
    #[serde(default = "default_block_capacity")]
    pub block_capacity: u64,
    /// Byte budget of the segment disk cache
    #[serde(default = "default_segment_cache_capacity")]
    pub segment_cache_capacity: u64,
    /// Maximum number of concurrently open file handles
    #[serde(default = "default_max_open_files")]
    pub max_open_files: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            block_dir: default_block_dir(),
            segment_cache_dir: default_segment_cache_dir(),
            block_capacity: default_block_capacity(),
            segment_cache_capacity: default_segment_cache_capacity(),
            max_open_files: default_max_open_files(),
        }
    }
}

/// Transfer and fan-out tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Payload size of one data chunk sent to a peer
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Parallel block distributions per upload or repair
    #[serde(default = "default_workers")]
    pub distribution_workers: usize,
    /// Parallel symbol fetches per repair
    #[serde(default = "default_workers")]
    pub recovery_workers: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            distribution_workers: default_workers(),
            recovery_workers: default_workers(),
        }
    }
}

/// Log output settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

const fn default_node_id() -> NodeId {
    NodeId::new(0)
}

fn default_block_dir() -> PathBuf {
    PathBuf::from("./osd-data/blocks")
}

fn default_segment_cache_dir() -> PathBuf {
    PathBuf::from("./osd-data/segments")
}

const fn default_block_capacity() -> u64 {
    64 * 1024 * 1024 * 1024 // 64 GB
}

const fn default_segment_cache_capacity() -> u64 {
    4 * 1024 * 1024 * 1024 // 4 GB
}

const fn default_max_open_files() -> usize {
    100
}

const fn default_chunk_size() -> usize {
    1024 * 1024 // 1 MB
}

const fn default_workers() -> usize {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OsdConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.max_open_files, 100);
        assert_eq!(config.transfer.recovery_workers, 10);
    }

    #[test]
    fn test_partial_toml() {
        let config: OsdConfig = toml::from_str(
            r#"
            [node]
            node_id = 3

            [storage]
            block_dir = "/data/blocks"
            segment_cache_capacity = 1048576
            "#,
        )
        .unwrap();

        assert_eq!(config.node.node_id, NodeId::new(3));
        assert_eq!(config.storage.block_dir, PathBuf::from("/data/blocks"));
        assert_eq!(config.storage.segment_cache_capacity, 1_048_576);
        assert_eq!(config.storage.max_open_files, 100);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let mut config = OsdConfig::default();
        config.transfer.chunk_size = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }
}
