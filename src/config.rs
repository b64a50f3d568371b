//! WolfTable Configuration
//!
//! Configuration structures for a replicated table node: node identity,
//! table schema, replication tunables and the HTTP API.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main WolfTable configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfTableConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Table schema configuration
    pub table: TableSchema,

    /// Replication configuration
    #[serde(default)]
    pub replication: ReplicationSettings,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique replica name within the table
    pub replica_name: String,

    /// Data directory for local parts
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Address to bind for the inter-replica part exchange
    #[serde(default = "default_exchange_bind")]
    pub exchange_bind: String,

    /// Advertised host for other replicas to connect
    #[serde(default = "default_host")]
    pub host: String,
}

/// A single column definition: name plus type string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Table schema configuration.
///
/// The serialized form of this section (see `metadata_text` in
/// `table::metadata`) must match the coordinator's `metadata` node
/// byte-for-byte on every replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name
    pub name: String,

    /// Path of the table subtree in the coordination service
    pub coordinator_path: String,

    /// Name of the date column used for month partitioning
    pub date_column: String,

    /// Sampling expression (empty when not sampled)
    #[serde(default)]
    pub sampling_expression: String,

    /// Index granularity in rows
    #[serde(default = "default_index_granularity")]
    pub index_granularity: u64,

    /// Storage mode (plain merge = 0)
    #[serde(default)]
    pub mode: i32,

    /// Sign column for collapsing modes (empty otherwise)
    #[serde(default)]
    pub sign_column: String,

    /// Primary key expression
    pub primary_key: String,

    /// Ordered column list
    pub columns: Vec<ColumnDef>,
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Upper bound on MERGE entries simultaneously present in the queue
    #[serde(default = "default_max_merges_in_queue")]
    pub max_replicated_merges_in_queue: usize,

    /// How many recent insert blocks to keep for deduplication
    #[serde(default = "default_dedup_window")]
    pub replicated_deduplication_window: usize,

    /// Maximum number of parts merged at once
    #[serde(default = "default_max_parts_per_merge")]
    pub max_parts_per_merge: usize,

    /// Queue update loop interval in milliseconds
    #[serde(default = "default_queue_update_interval_ms")]
    pub queue_update_interval_ms: u64,

    /// Merge selector sleep when there is nothing to merge, in milliseconds
    #[serde(default = "default_merge_selecting_sleep_ms")]
    pub merge_selecting_sleep_ms: u64,

    /// Restarter poll interval in milliseconds
    #[serde(default = "default_restart_poll_interval_ms")]
    pub restart_poll_interval_ms: u64,

    /// Number of background pool workers draining the queue
    #[serde(default = "default_background_pool_size")]
    pub background_pool_size: usize,

    /// How long replaced parts are kept on disk before removal, in seconds
    #[serde(default)]
    pub old_parts_lifetime_secs: u64,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            max_replicated_merges_in_queue: default_max_merges_in_queue(),
            replicated_deduplication_window: default_dedup_window(),
            max_parts_per_merge: default_max_parts_per_merge(),
            queue_update_interval_ms: default_queue_update_interval_ms(),
            merge_selecting_sleep_ms: default_merge_selecting_sleep_ms(),
            restart_poll_interval_ms: default_restart_poll_interval_ms(),
            background_pool_size: default_background_pool_size(),
            old_parts_lifetime_secs: 0,
        }
    }
}

impl ReplicationSettings {
    pub fn queue_update_interval(&self) -> Duration {
        Duration::from_millis(self.queue_update_interval_ms)
    }

    pub fn merge_selecting_sleep(&self) -> Duration {
        Duration::from_millis(self.merge_selecting_sleep_ms)
    }

    pub fn restart_poll_interval(&self) -> Duration {
        Duration::from_millis(self.restart_poll_interval_ms)
    }

    pub fn old_parts_lifetime(&self) -> Duration {
        Duration::from_secs(self.old_parts_lifetime_secs)
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable the HTTP API
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,

    /// Address to bind the HTTP API
    #[serde(default = "default_api_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            bind: default_api_bind(),
        }
    }
}

impl WolfTableConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfTableConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.replica_name.is_empty() {
            return Err(Error::Config("node.replica_name must not be empty".into()));
        }
        if self.table.coordinator_path.is_empty() || !self.table.coordinator_path.starts_with('/') {
            return Err(Error::Config(
                "table.coordinator_path must be an absolute path".into(),
            ));
        }
        if self.table.columns.is_empty() {
            return Err(Error::Config("table.columns must not be empty".into()));
        }
        if !self
            .table
            .columns
            .iter()
            .any(|c| c.name == self.table.date_column)
        {
            return Err(Error::Config(format!(
                "date column `{}` is not in the column list",
                self.table.date_column
            )));
        }
        if self.replication.max_parts_per_merge < 2 {
            return Err(Error::Config(
                "replication.max_parts_per_merge must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_exchange_bind() -> String {
    "127.0.0.1:9412".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_index_granularity() -> u64 {
    8192
}

fn default_max_merges_in_queue() -> usize {
    6
}

fn default_dedup_window() -> usize {
    100
}

fn default_max_parts_per_merge() -> usize {
    10
}

fn default_queue_update_interval_ms() -> u64 {
    5000
}

fn default_merge_selecting_sleep_ms() -> u64 {
    5000
}

fn default_restart_poll_interval_ms() -> u64 {
    2000
}

fn default_background_pool_size() -> usize {
    2
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_bind() -> String {
    "127.0.0.1:9413".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> WolfTableConfig {
        toml::from_str(
            r#"
            [node]
            replica_name = "r1"

            [table]
            name = "hits"
            coordinator_path = "/wolftable/hits"
            date_column = "event_date"
            primary_key = "(counter_id, event_date)"
            columns = [
                { name = "event_date", type = "Date" },
                { name = "counter_id", type = "UInt32" },
            ]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config = sample_config();
        assert_eq!(config.table.index_granularity, 8192);
        assert_eq!(config.replication.max_replicated_merges_in_queue, 6);
        assert!(config.api.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_date_column() {
        let mut config = sample_config();
        config.table.date_column = "nope".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_coordinator_path() {
        let mut config = sample_config();
        config.table.coordinator_path = "hits".into();
        assert!(config.validate().is_err());
    }
}
