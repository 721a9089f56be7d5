use serde::{Deserialize, Serialize};

use crate::Config;
use crate::shared::{
    BatchConfig, PgConnectionConfig, PipelineChannelConfig, ProgressStoreConfig, ValidationError,
};

/// Output plugin the replication slot decodes changes with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodingPluginKind {
    /// The textual `test_decoding` plugin shipped with Postgres.
    #[default]
    TestDecoding,
    /// The JSON `mppdb_decoding` plugin of openGauss-style servers.
    MppdbDecoding,
}

impl DecodingPluginKind {
    /// Name of the plugin as given to `CREATE_REPLICATION_SLOT`.
    pub fn plugin_name(&self) -> &'static str {
        match self {
            DecodingPluginKind::TestDecoding => "test_decoding",
            DecodingPluginKind::MppdbDecoding => "mppdb_decoding",
        }
    }
}

/// Settings of the incremental (replication stream) task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IncrementalConfig {
    #[serde(default)]
    pub plugin: DecodingPluginKind,
    /// Sleep between polls that returned nothing.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
    /// Buffers row changes between begin and commit and pushes them together.
    #[serde(default)]
    pub decode_with_tx: bool,
    /// Interval between unsolicited status updates sent to the server.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

impl IncrementalConfig {
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

    pub const DEFAULT_CONNECT_MAX_ATTEMPTS: u32 = 5;

    pub const DEFAULT_CONNECT_RETRY_DELAY_MS: u64 = 1000;

    pub const DEFAULT_STATUS_INTERVAL_MS: u64 = 10_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.connect_max_attempts == 0 {
            return Err(ValidationError::must_be_positive(
                "incremental.connect_max_attempts",
            ));
        }
        if self.status_interval_ms == 0 {
            return Err(ValidationError::must_be_positive(
                "incremental.status_interval_ms",
            ));
        }

        Ok(())
    }
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            plugin: DecodingPluginKind::default(),
            poll_interval_ms: default_poll_interval_ms(),
            connect_max_attempts: default_connect_max_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            decode_with_tx: false,
            status_interval_ms: default_status_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    IncrementalConfig::DEFAULT_POLL_INTERVAL_MS
}

fn default_connect_max_attempts() -> u32 {
    IncrementalConfig::DEFAULT_CONNECT_MAX_ATTEMPTS
}

fn default_connect_retry_delay_ms() -> u64 {
    IncrementalConfig::DEFAULT_CONNECT_RETRY_DELAY_MS
}

fn default_status_interval_ms() -> u64 {
    IncrementalConfig::DEFAULT_STATUS_INTERVAL_MS
}

/// Settings of the inventory (bulk copy) tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct InventoryConfig {
    /// Skips the bulk copy when the target already holds the existing rows.
    #[serde(default = "default_inventory_enabled")]
    pub enabled: bool,
    /// Rows read per page.
    #[serde(default = "default_inventory_batch_size")]
    pub batch_size: usize,
}

impl InventoryConfig {
    pub const DEFAULT_BATCH_SIZE: usize = 1000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::must_be_positive("inventory.batch_size"));
        }

        Ok(())
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            enabled: default_inventory_enabled(),
            batch_size: default_inventory_batch_size(),
        }
    }
}

fn default_inventory_enabled() -> bool {
    true
}

fn default_inventory_batch_size() -> usize {
    InventoryConfig::DEFAULT_BATCH_SIZE
}

/// The tables migrated by one shard item, as `schema.table` names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobShardConfig {
    pub tables: Vec<String>,
}

/// Configuration of a migration job and all of its shard items.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JobConfig {
    pub job_id: String,
    pub source: PgConnectionConfig,
    #[serde(default)]
    pub channel: PipelineChannelConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub incremental: IncrementalConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
    /// One entry per shard item, indexed by the item number.
    pub shards: Vec<JobShardConfig>,
}

impl JobConfig {
    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    /// Returns the shard definition of `shard_item`.
    pub fn shard(&self, shard_item: u32) -> Result<&JobShardConfig, ValidationError> {
        self.shards
            .get(shard_item as usize)
            .ok_or_else(|| ValidationError::UnknownShardItem {
                job_id: self.job_id.clone(),
                shard_item,
            })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.job_id.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "job_id".to_string(),
                constraint: "must not be empty".to_string(),
            });
        }
        if self.shards.is_empty() {
            return Err(ValidationError::must_be_positive("shards"));
        }

        self.source.validate()?;
        self.channel.validate()?;
        self.batch.validate()?;
        self.incremental.validate()?;
        self.inventory.validate()
    }
}

/// Top-level configuration of the `migrator` binary.
///
/// Does not implement [`Serialize`] since the source connections carry secrets.
#[derive(Debug, Clone, Deserialize)]
pub struct MigratorConfig {
    #[serde(default)]
    pub progress_store: ProgressStoreConfig,
    pub jobs: Vec<JobConfig>,
}

impl MigratorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for job in &self.jobs {
            job.validate()?;
        }

        Ok(())
    }
}

impl Config for MigratorConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}
