use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Kind of pipeline channel connecting dumpers to sinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// A single bounded in-memory queue.
    Memory,
    /// Records fanned out over several bounded queues by partition key.
    #[default]
    Multiplexed,
}

/// Configuration of the channel created for each shard item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineChannelConfig {
    #[serde(default)]
    pub kind: ChannelKind,
    /// Number of sub-channels for [`ChannelKind::Multiplexed`]. Ignored for memory channels.
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    /// Capacity of every sub-channel, in records.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl PipelineChannelConfig {
    pub const DEFAULT_PARTITIONS: usize = 4;

    pub const DEFAULT_CAPACITY: usize = 10_000;

    /// Number of partitions the channel is going to have once built.
    pub fn effective_partitions(&self) -> usize {
        match self.kind {
            ChannelKind::Memory => 1,
            ChannelKind::Multiplexed => self.partitions,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.kind == ChannelKind::Multiplexed && self.partitions == 0 {
            return Err(ValidationError::must_be_positive("channel.partitions"));
        }
        if self.capacity == 0 {
            return Err(ValidationError::must_be_positive("channel.capacity"));
        }

        Ok(())
    }
}

impl Default for PipelineChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::default(),
            partitions: default_partitions(),
            capacity: default_capacity(),
        }
    }
}

fn default_partitions() -> usize {
    PipelineChannelConfig::DEFAULT_PARTITIONS
}

fn default_capacity() -> usize {
    PipelineChannelConfig::DEFAULT_CAPACITY
}
