use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::PipelineResult;
use crate::sink::Sink;
use crate::types::DataRecord;

/// In-memory sink keeping every written record, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<DataRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every record written so far, in write order.
    pub async fn records(&self) -> Vec<DataRecord> {
        self.records.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.records.lock().await.clear();
    }
}

impl Sink for MemorySink {
    fn name() -> &'static str {
        "memory"
    }

    async fn write_records(&self, records: Vec<DataRecord>) -> PipelineResult<()> {
        debug!(count = records.len(), "writing records to memory sink");
        self.records.lock().await.extend(records);

        Ok(())
    }
}
