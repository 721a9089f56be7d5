use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::error::PipelineResult;

/// Raw payload of one replication message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalPayload {
    /// WAL position the message starts at.
    pub lsn: u64,
    pub data: Bytes,
}

/// Logical replication connection consumed by the incremental dumper.
///
/// Implementations are driven by a single task, so every method takes `&mut self`.
pub trait ReplicationSource: Send {
    /// Opens the replication connection.
    fn connect(&mut self) -> impl Future<Output = PipelineResult<()>> + Send;

    /// Returns the confirmed position of `slot_name`, creating the slot first when it does
    /// not exist.
    fn get_or_create_slot(
        &mut self,
        slot_name: &str,
    ) -> impl Future<Output = PipelineResult<u64>> + Send;

    /// Starts streaming changes of `slot_name` from `start_lsn`.
    fn start_stream(
        &mut self,
        slot_name: &str,
        start_lsn: u64,
    ) -> impl Future<Output = PipelineResult<()>> + Send;

    /// Returns the next buffered payload without waiting for the server, or `None` when
    /// nothing is buffered.
    fn read_pending(&mut self) -> impl Future<Output = PipelineResult<Option<WalPayload>>> + Send;

    /// Tells the server every change up to `lsn` has been applied.
    fn report_flushed(&mut self, lsn: u64) -> impl Future<Output = PipelineResult<()>> + Send;

    fn close(&mut self) -> impl Future<Output = PipelineResult<()>> + Send;
}

/// Highest WAL position acknowledged by the importer.
///
/// Written by the channel's ack callback and read by the dumper when it reports progress
/// to the server.
#[derive(Debug, Clone, Default)]
pub struct AckedLsn(Arc<AtomicU64>);

impl AckedLsn {
    pub fn new(lsn: u64) -> Self {
        Self(Arc::new(AtomicU64::new(lsn)))
    }

    /// Moves the position forward. Older positions are ignored.
    pub fn advance(&self, lsn: u64) {
        self.0.fetch_max(lsn, Ordering::AcqRel);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}
