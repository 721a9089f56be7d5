//! Record transport between dumpers and importers.

mod base;
mod memory;
mod multiplex;

use std::sync::Arc;
use std::time::Duration;

use config::shared::{ChannelKind, PipelineChannelConfig};

pub use base::*;
pub use memory::*;
pub use multiplex::*;

use crate::error::PipelineResult;
use crate::types::Record;

/// Channel selected by [`PipelineChannelConfig::kind`].
pub enum Channel {
    Memory(MemoryChannel),
    Multiplexed(MultiplexChannel),
}

/// Builds the channel described by `config`, releasing acknowledged records to `callback`.
pub fn create_channel(config: &PipelineChannelConfig, callback: Arc<dyn AckCallback>) -> Channel {
    match config.kind {
        ChannelKind::Memory => Channel::Memory(MemoryChannel::new(config.capacity, callback)),
        ChannelKind::Multiplexed => Channel::Multiplexed(MultiplexChannel::new(
            config.effective_partitions(),
            config.capacity,
            callback,
        )),
    }
}

impl PipelineChannel for Channel {
    async fn push(&self, records: Vec<Record>) -> PipelineResult<()> {
        match self {
            Channel::Memory(channel) => channel.push(records).await,
            Channel::Multiplexed(channel) => channel.push(records).await,
        }
    }

    async fn fetch(&self, batch_size: usize, timeout: Duration) -> PipelineResult<Vec<Record>> {
        match self {
            Channel::Memory(channel) => channel.fetch(batch_size, timeout).await,
            Channel::Multiplexed(channel) => channel.fetch(batch_size, timeout).await,
        }
    }

    async fn ack(&self, records: Vec<Record>) -> PipelineResult<()> {
        match self {
            Channel::Memory(channel) => channel.ack(records).await,
            Channel::Multiplexed(channel) => channel.ack(records).await,
        }
    }

    fn partitions(&self) -> usize {
        match self {
            Channel::Memory(channel) => channel.partitions(),
            Channel::Multiplexed(channel) => channel.partitions(),
        }
    }

    async fn close(&self) {
        match self {
            Channel::Memory(channel) => channel.close().await,
            Channel::Multiplexed(channel) => channel.close().await,
        }
    }
}
