use std::time::Duration;

use crate::error::PipelineResult;
use crate::types::{DataRecord, Position, Record};

/// Receives acknowledged records in source order.
///
/// Invoked while the channel holds its ordering lock, so implementations must not block
/// and must not call back into the channel.
pub trait AckCallback: Send + Sync {
    /// Called with the data records released by one acknowledgement.
    fn on_ack(&self, records: Vec<DataRecord>);

    /// Called with the position of the last released record of each position kind,
    /// placeholders included. A release covering both replication and inventory records
    /// reports the last position of each. Every record before them has been acknowledged.
    fn on_acked_position(&self, _position: Position) {}
}

impl<F> AckCallback for F
where
    F: Fn(Vec<DataRecord>) + Send + Sync,
{
    fn on_ack(&self, records: Vec<DataRecord>) {
        self(records)
    }
}

/// Transport between producers (dumpers) and consumers (importers).
///
/// A consumer calls [`PipelineChannel::fetch`], applies the batch and passes the same
/// records back to [`PipelineChannel::ack`].
pub trait PipelineChannel {
    /// Pushes records, waiting while the target sub-channel is full.
    fn push(&self, records: Vec<Record>) -> impl Future<Output = PipelineResult<()>> + Send;

    /// Waits up to `timeout` for records and returns at most `batch_size` of them. An empty
    /// batch means the timeout elapsed.
    fn fetch(
        &self,
        batch_size: usize,
        timeout: Duration,
    ) -> impl Future<Output = PipelineResult<Vec<Record>>> + Send;

    /// Acknowledges a batch returned by [`PipelineChannel::fetch`].
    fn ack(&self, records: Vec<Record>) -> impl Future<Output = PipelineResult<()>> + Send;

    /// Number of sub-channels. Every one of them yields one `Finished` record per finished
    /// producer.
    fn partitions(&self) -> usize;

    /// Rejects further pushes and wakes blocked producers and consumers.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
