use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use config::shared::BatchConfig;
use tracing::{debug, info, warn};

use crate::channel::PipelineChannel;
use crate::concurrency::stop::StopRx;
use crate::error::PipelineResult;
use crate::failpoints::{IMPORTER_BEFORE_ACK, pipeline_fail_point};
use crate::sink::Sink;
use crate::types::Record;

/// Counts the `Finished` records seen by the importers of a shard item.
///
/// Every producer emits one `Finished` record per channel partition, so the channel is
/// drained once `producers * partitions` of them have been fetched.
#[derive(Debug)]
pub struct DrainTracker {
    expected: usize,
    observed: AtomicUsize,
}

impl DrainTracker {
    pub fn new(producers: usize, partitions: usize) -> Self {
        Self {
            expected: producers * partitions,
            observed: AtomicUsize::new(0),
        }
    }

    fn observe(&self, finished: usize) {
        if finished > 0 {
            self.observed.fetch_add(finished, Ordering::AcqRel);
        }
    }

    pub fn is_drained(&self) -> bool {
        self.observed.load(Ordering::Acquire) >= self.expected
    }
}

/// Moves records from a pipeline channel into a [`Sink`].
///
/// A fetched batch is acknowledged only after the sink accepted its data records.
pub struct Importer<C, K> {
    channel: Arc<C>,
    sink: K,
    batch: BatchConfig,
    drain: Arc<DrainTracker>,
    stop_rx: StopRx,
}

impl<C, K> Importer<C, K>
where
    C: PipelineChannel + Send + Sync,
    K: Sink + Send + Sync,
{
    pub fn new(
        channel: Arc<C>,
        sink: K,
        batch: BatchConfig,
        drain: Arc<DrainTracker>,
        stop_rx: StopRx,
    ) -> Self {
        Self {
            channel,
            sink,
            batch,
            drain,
            stop_rx,
        }
    }

    /// Imports until stop is requested or every producer finished.
    pub async fn run(&self) -> PipelineResult<()> {
        info!(sink = K::name(), "importer started");

        let result = self.import().await;

        if let Err(err) = self.sink.shutdown().await {
            warn!(sink = K::name(), error = %err, "sink shutdown failed");
        }

        result
    }

    async fn import(&self) -> PipelineResult<()> {
        let fetch_timeout = Duration::from_millis(self.batch.max_fetch_ms);

        loop {
            if self.stop_rx.is_stopped() {
                info!(sink = K::name(), "importer stopped");
                return Ok(());
            }
            if self.drain.is_drained() {
                info!(sink = K::name(), "importer finished");
                return Ok(());
            }

            let records = self
                .channel
                .fetch(self.batch.max_size, fetch_timeout)
                .await?;
            if records.is_empty() {
                continue;
            }

            let mut finished = 0;
            let mut data = Vec::with_capacity(records.len());
            for record in &records {
                match record {
                    Record::Data(record) => data.push(record.clone()),
                    Record::Finished { .. } => finished += 1,
                    Record::Placeholder { .. } => {}
                }
            }

            if !data.is_empty() {
                let count = data.len();
                self.sink.write_records(data).await?;
                debug!(sink = K::name(), count, "records written");
            }

            pipeline_fail_point(IMPORTER_BEFORE_ACK)?;

            self.channel.ack(records).await?;
            self.drain.observe(finished);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MultiplexChannel;
    use crate::concurrency::stop::create_stop_signal;
    use crate::sink::memory::MemorySink;
    use crate::types::{Column, DataRecord, OperationType, Position, TableName, Value};

    fn insert(id: i64, lsn: u64) -> Record {
        let mut record = DataRecord::new(
            OperationType::Insert,
            TableName::new("public", "t_order"),
            Position::Wal(lsn),
        );
        record.after_row = vec![Column::new("id", Value::I64(id)).primary_key()];
        Record::Data(record)
    }

    fn batch() -> BatchConfig {
        BatchConfig {
            max_size: 2,
            max_fetch_ms: 10,
        }
    }

    #[tokio::test]
    async fn writes_until_every_producer_finished() {
        let acked = Arc::new(std::sync::Mutex::new(Vec::new()));
        let acked_clone = acked.clone();
        let channel = Arc::new(MultiplexChannel::new(
            2,
            16,
            Arc::new(move |records: Vec<DataRecord>| {
                acked_clone.lock().unwrap().extend(records);
            }),
        ));
        channel
            .push(vec![
                insert(1, 10),
                insert(2, 20),
                insert(3, 30),
                Record::Finished {
                    position: Position::Wal(30),
                },
            ])
            .await
            .unwrap();

        let sink = MemorySink::new();
        let drain = Arc::new(DrainTracker::new(1, channel.partitions()));
        let (_stop_tx, stop_rx) = create_stop_signal();
        let importer = Importer::new(channel.clone(), sink.clone(), batch(), drain.clone(), stop_rx);

        tokio::time::timeout(Duration::from_secs(2), importer.run())
            .await
            .unwrap()
            .unwrap();

        assert!(drain.is_drained());
        assert_eq!(sink.records().await.len(), 3);
        assert_eq!(acked.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn stop_ends_the_import() {
        let channel = Arc::new(MultiplexChannel::new(
            1,
            16,
            Arc::new(|_: Vec<DataRecord>| {}),
        ));
        let (stop_tx, stop_rx) = create_stop_signal();
        let importer = Importer::new(
            channel,
            MemorySink::new(),
            batch(),
            Arc::new(DrainTracker::new(1, 1)),
            stop_rx,
        );

        stop_tx.stop();

        tokio::time::timeout(Duration::from_secs(2), importer.run())
            .await
            .unwrap()
            .unwrap();
    }
}
