use std::sync::Arc;
use std::time::Duration;

use crate::channel::{AckCallback, MultiplexChannel, PipelineChannel};
use crate::error::PipelineResult;
use crate::types::Record;

/// Single bounded in-memory queue.
///
/// Behaves like a [`MultiplexChannel`] with one sub-channel: records are fetched in push
/// order, one batch at a time, and a single `Finished` drains it.
pub struct MemoryChannel {
    queue: MultiplexChannel,
}

impl MemoryChannel {
    pub fn new(capacity: usize, callback: Arc<dyn AckCallback>) -> Self {
        Self {
            queue: MultiplexChannel::new(1, capacity, callback),
        }
    }
}

impl PipelineChannel for MemoryChannel {
    async fn push(&self, records: Vec<Record>) -> PipelineResult<()> {
        self.queue.push(records).await
    }

    async fn fetch(&self, batch_size: usize, timeout: Duration) -> PipelineResult<Vec<Record>> {
        self.queue.fetch(batch_size, timeout).await
    }

    async fn ack(&self, records: Vec<Record>) -> PipelineResult<()> {
        self.queue.ack(records).await
    }

    fn partitions(&self) -> usize {
        1
    }

    async fn close(&self) {
        self.queue.close().await
    }
}
