//! Configuration types for Arbor
//!
//! Every section can be written in a TOML file; missing fields fall back
//! to their defaults.
//!
//! ```toml
//! data_dir = "/var/lib/arbor"
//! attributes = ["md5", "owner"]
//!
//! [base]
//! read_ahead_bytes = 65536
//! preload = "read_ahead"
//!
//! [overlay]
//! sync_on_write = true
//! roll_threshold_bytes = 67108864
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration for a tree store
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the manifest, base index and overlay segments
    pub data_dir: PathBuf,
    /// Attribute names to register at open time
    pub attributes: Vec<String>,
    /// Base index paging
    pub base: BaseIndexConfig,
    /// Eviction heuristics
    pub eviction: EvictionConfig,
    /// Overlay log
    pub overlay: OverlayConfig,
    /// Roll and compaction scheduling
    pub compaction: CompactionConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./arbor-data"),
            attributes: Vec::new(),
            base: BaseIndexConfig::default(),
            eviction: EvictionConfig::default(),
            overlay: OverlayConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create config with data directory
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.base.read_ahead_bytes < 64 {
            return Err(Error::Configuration(
                "base.read_ahead_bytes must be at least 64".into(),
            ));
        }
        if self.eviction.min_subtree_bytes > self.eviction.max_subtree_bytes {
            return Err(Error::Configuration(
                "eviction.min_subtree_bytes exceeds eviction.max_subtree_bytes".into(),
            ));
        }
        if self.eviction.max_picks_per_level == 0 {
            return Err(Error::Configuration(
                "eviction.max_picks_per_level must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// How much of the base index to decode when it is opened
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadMode {
    /// Decode only the root frame
    RootOnly,
    /// Decode the root plus whatever else fits in the first read
    #[default]
    ReadAhead,
}

/// Base index configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseIndexConfig {
    /// Bytes fetched per frame load; extra frames in the buffer are parsed too
    pub read_ahead_bytes: usize,
    /// Preload behaviour at open
    pub preload: PreloadMode,
}

impl Default for BaseIndexConfig {
    fn default() -> Self {
        Self {
            read_ahead_bytes: 64 * 1024, // 64KB
            preload: PreloadMode::ReadAhead,
        }
    }
}

/// Eviction heuristics for the base index
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Directories shallower than this are never evicted by level eviction
    pub min_depth_directory: usize,
    /// Files shallower than this are never evicted by level eviction
    pub min_depth_file: usize,
    /// Subtrees smaller than this are not worth evicting
    pub min_subtree_bytes: u64,
    /// Subtrees larger than this are too costly to reload
    pub max_subtree_bytes: u64,
    /// Random picks allowed at each level before giving up on it
    pub max_picks_per_level: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            min_depth_directory: 2,
            min_depth_file: 1,
            min_subtree_bytes: 4 * 1024,          // 4KB
            max_subtree_bytes: 16 * 1024 * 1024, // 16MB
            max_picks_per_level: 8,
        }
    }
}

/// Overlay log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Sync after every append
    pub sync_on_write: bool,
    /// Buffer size for the segment writer
    pub write_buffer_size: usize,
    /// Active segment size that triggers a roll
    pub roll_threshold_bytes: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            write_buffer_size: 64 * 1024,           // 64KB
            roll_threshold_bytes: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// Roll and compaction scheduling
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Run maintenance on a background thread
    pub background: bool,
    /// Seconds between maintenance checks
    pub interval_secs: u64,
    /// Frozen segments tolerated before a compaction is due
    pub max_frozen_segments: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            background: false,
            interval_secs: 60,
            max_frozen_segments: 4,
        }
    }
}
