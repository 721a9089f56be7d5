use std::collections::VecDeque;

use bytes::Bytes;

use crate::bail;
use crate::error::{ErrorKind, PipelineResult};
use crate::ingest::{InventorySource, ReplicationSource, WalPayload};
use crate::types::{Column, TableName};

/// [`ReplicationSource`] replaying fixed payloads.
///
/// Once the payloads are consumed it fails with `end_error` when set, and otherwise
/// reports an idle stream forever.
#[derive(Debug, Clone)]
pub struct ScriptedReplicationSource {
    /// Number of initial `connect` calls that fail.
    pub connect_failures: u32,
    pub connect_calls: u32,
    /// Position returned for the replication slot.
    pub slot_lsn: u64,
    pub start_lsn: Option<u64>,
    pub payloads: VecDeque<WalPayload>,
    pub end_error: Option<ErrorKind>,
    pub flushed: Vec<u64>,
    pub closed: bool,
}

impl ScriptedReplicationSource {
    pub fn new<S>(payloads: impl IntoIterator<Item = (u64, S)>) -> Self
    where
        S: AsRef<str>,
    {
        Self {
            connect_failures: 0,
            connect_calls: 0,
            slot_lsn: 1,
            start_lsn: None,
            payloads: payloads
                .into_iter()
                .map(|(lsn, data)| WalPayload {
                    lsn,
                    data: Bytes::copy_from_slice(data.as_ref().as_bytes()),
                })
                .collect(),
            end_error: None,
            flushed: Vec::new(),
            closed: false,
        }
    }

    /// Source without payloads.
    pub fn idle() -> Self {
        Self::new(std::iter::empty::<(u64, &str)>())
    }

    pub fn with_end_error(mut self, kind: ErrorKind) -> Self {
        self.end_error = Some(kind);
        self
    }
}

impl ReplicationSource for ScriptedReplicationSource {
    async fn connect(&mut self) -> PipelineResult<()> {
        self.connect_calls += 1;
        if self.connect_calls <= self.connect_failures {
            bail!(ErrorKind::SourceConnectionFailed, "Connection refused");
        }

        Ok(())
    }

    async fn get_or_create_slot(&mut self, _slot_name: &str) -> PipelineResult<u64> {
        Ok(self.slot_lsn)
    }

    async fn start_stream(&mut self, _slot_name: &str, start_lsn: u64) -> PipelineResult<()> {
        self.start_lsn = Some(start_lsn);
        Ok(())
    }

    async fn read_pending(&mut self) -> PipelineResult<Option<WalPayload>> {
        if let Some(payload) = self.payloads.pop_front() {
            return Ok(Some(payload));
        }

        match self.end_error {
            Some(kind) => bail!(kind, "Scripted replication stream failure"),
            None => Ok(None),
        }
    }

    async fn report_flushed(&mut self, lsn: u64) -> PipelineResult<()> {
        self.flushed.push(lsn);
        Ok(())
    }

    async fn close(&mut self) -> PipelineResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// [`InventorySource`] serving fixed rows, at most `limit` per page.
#[derive(Debug, Clone)]
pub struct ScriptedInventorySource {
    pub table_name: TableName,
    pub rows: VecDeque<Vec<Column>>,
    pub requested_limits: Vec<usize>,
}

impl ScriptedInventorySource {
    pub fn new(table_name: TableName, rows: impl IntoIterator<Item = Vec<Column>>) -> Self {
        Self {
            table_name,
            rows: rows.into_iter().collect(),
            requested_limits: Vec::new(),
        }
    }
}

impl InventorySource for ScriptedInventorySource {
    fn table_name(&self) -> &TableName {
        &self.table_name
    }

    async fn next_page(&mut self, limit: usize) -> PipelineResult<Vec<Vec<Column>>> {
        self.requested_limits.push(limit);

        let count = limit.min(self.rows.len());
        Ok(self.rows.drain(..count).collect())
    }
}
