use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::conflict::{ConflictLogLevel, ConflictPolicy};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub apply: ApplyConfig,
    #[serde(default)]
    pub conflicts: ConflictConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplyConfig {
    /// Route conflict-free inserts through the multi-insert buffer.
    #[serde(default = "default_multi_insert")]
    pub multi_insert: bool,
    /// Rows buffered before a bulk write when batching is safe.
    #[serde(default = "default_multi_insert_capacity")]
    pub multi_insert_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConflictConfig {
    #[serde(default)]
    pub resolver: ConflictPolicy,
    #[serde(default)]
    pub log_level: ConflictLogLevel,
    #[serde(default)]
    pub keep_history: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplayConfig {
    /// Origin id stamped on rows written locally (not by replication).
    #[serde(default)]
    pub node_origin: u16,
    #[serde(default = "default_track_commit_timestamp")]
    pub track_commit_timestamp: bool,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_APPLY")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Effective multi-insert capacity; never below one row.
    pub fn multi_insert_capacity(&self) -> usize {
        self.apply.multi_insert_capacity.max(1)
    }
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            multi_insert: default_multi_insert(),
            multi_insert_capacity: default_multi_insert_capacity(),
        }
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            resolver: ConflictPolicy::default(),
            log_level: ConflictLogLevel::default(),
            keep_history: false,
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            node_origin: 0,
            track_commit_timestamp: default_track_commit_timestamp(),
        }
    }
}

fn default_multi_insert() -> bool {
    true
}

fn default_multi_insert_capacity() -> usize {
    1000
}

fn default_track_commit_timestamp() -> bool {
    true
}
