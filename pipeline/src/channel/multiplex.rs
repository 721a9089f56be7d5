use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bail;
use crate::channel::{AckCallback, PipelineChannel};
use crate::error::{ErrorKind, PipelineResult};
use crate::types::{DataRecord, Position, Record};

/// Identifies a fetched record without keeping a copy of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordKey {
    position: Position,
    kind: RecordKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Data,
    Placeholder,
    Finished,
}

impl From<&Record> for RecordKey {
    fn from(record: &Record) -> Self {
        let kind = match record {
            Record::Data(_) => RecordKind::Data,
            Record::Placeholder { .. } => RecordKind::Placeholder,
            Record::Finished { .. } => RecordKind::Finished,
        };

        RecordKey {
            position: record.position(),
            kind,
        }
    }
}

#[derive(Debug)]
struct Queued {
    sequence: u64,
    record: Record,
}

/// Batch handed out by `fetch` and not acknowledged yet.
#[derive(Debug)]
struct InFlight {
    sequences: Vec<u64>,
    keys: Vec<RecordKey>,
}

#[derive(Debug, Default)]
struct PartitionState {
    queue: VecDeque<Queued>,
    in_flight: Option<InFlight>,
}

/// A pushed record waiting for itself and every earlier record to be acknowledged.
#[derive(Debug)]
struct PendingAck {
    partition: usize,
    position: Position,
    acked: bool,
    data: Option<DataRecord>,
}

#[derive(Debug)]
struct Inner {
    partitions: Vec<PartitionState>,
    /// Every pushed and not yet released record, keyed by push sequence.
    pending: BTreeMap<u64, PendingAck>,
    next_sequence: u64,
    next_fetch_partition: usize,
    closed: bool,
}

impl Inner {
    /// Takes the next batch from the first partition, in round-robin order, that has queued
    /// records and no batch in flight.
    fn take_batch(&mut self, batch_size: usize) -> Option<Vec<Record>> {
        let count = self.partitions.len();

        for offset in 0..count {
            let index = (self.next_fetch_partition + offset) % count;
            let partition = &mut self.partitions[index];
            if partition.in_flight.is_some() || partition.queue.is_empty() {
                continue;
            }

            let take = batch_size.min(partition.queue.len());
            let mut sequences = Vec::with_capacity(take);
            let mut keys = Vec::with_capacity(take);
            let mut records = Vec::with_capacity(take);
            for queued in partition.queue.drain(..take) {
                sequences.push(queued.sequence);
                keys.push(RecordKey::from(&queued.record));
                records.push(queued.record);
            }

            partition.in_flight = Some(InFlight { sequences, keys });
            self.next_fetch_partition = (index + 1) % count;

            return Some(records);
        }

        None
    }

    /// Finds the partition whose in-flight batch matches `keys`.
    ///
    /// Batches with data records are located by their partition hash. Batches of markers
    /// only are matched by content; among equal candidates the oldest batch is picked.
    fn find_in_flight(&self, records: &[Record], keys: &[RecordKey]) -> Option<usize> {
        let count = self.partitions.len();
        let matches = |index: usize| {
            self.partitions[index]
                .in_flight
                .as_ref()
                .is_some_and(|in_flight| in_flight.keys == keys)
        };

        let data = records.iter().find_map(|record| match record {
            Record::Data(data) => Some(data),
            _ => None,
        });
        if let Some(data) = data {
            let index = (data.partition_hash() % count as u64) as usize;
            return matches(index).then_some(index);
        }

        (0..count).filter(|index| matches(*index)).min_by_key(|index| {
            self.partitions[*index]
                .in_flight
                .as_ref()
                .and_then(|in_flight| in_flight.sequences.first().copied())
        })
    }

    /// Pops the acknowledged prefix of the pending records.
    fn release(&mut self) -> Released {
        let mut released = Released {
            data: Vec::new(),
            last_wal_position: None,
            last_inventory_position: None,
            freed: vec![0; self.partitions.len()],
        };

        while let Some(entry) = self.pending.first_entry() {
            if !entry.get().acked {
                break;
            }

            let pending = entry.remove();
            released.freed[pending.partition] += 1;
            match pending.position {
                Position::Wal(_) => released.last_wal_position = Some(pending.position),
                Position::Inventory(_) => {
                    released.last_inventory_position = Some(pending.position)
                }
            }
            released.data.extend(pending.data);
        }

        released
    }
}

struct Released {
    data: Vec<DataRecord>,
    /// Replication and inventory positions are separate streams and are tracked apart, so
    /// a trailing inventory record does not hide the replication position released with it.
    last_wal_position: Option<Position>,
    last_inventory_position: Option<Position>,
    /// Number of released records per partition.
    freed: Vec<usize>,
}

/// Channel fanning records out over several bounded sub-channels.
///
/// Data records are routed by [`DataRecord::partition_hash`], so every change of one row
/// goes through the same sub-channel. Placeholders are spread round-robin and `Finished`
/// is copied into every sub-channel.
///
/// A sub-channel hands out at most one batch at a time and its next records stay invisible
/// until that batch is acknowledged. Acknowledged records are released to the
/// [`AckCallback`] in push order across all sub-channels, so the acknowledged position
/// never skips an unacknowledged record.
///
/// Capacity is counted per sub-channel from push until release.
pub struct MultiplexChannel {
    inner: Mutex<Inner>,
    capacity: Vec<Semaphore>,
    /// Signalled when records become fetchable or a batch is acknowledged.
    notify: Notify,
    next_placeholder_partition: AtomicUsize,
    callback: Arc<dyn AckCallback>,
}

impl MultiplexChannel {
    /// Creates a channel with `partitions` sub-channels of `capacity` records each. Zero
    /// values are raised to one.
    pub fn new(partitions: usize, capacity: usize, callback: Arc<dyn AckCallback>) -> Self {
        let partitions = partitions.max(1);
        let capacity = capacity.max(1);

        Self {
            inner: Mutex::new(Inner {
                partitions: (0..partitions).map(|_| PartitionState::default()).collect(),
                pending: BTreeMap::new(),
                next_sequence: 0,
                next_fetch_partition: 0,
                closed: false,
            }),
            capacity: (0..partitions).map(|_| Semaphore::new(capacity)).collect(),
            notify: Notify::new(),
            next_placeholder_partition: AtomicUsize::new(0),
            callback,
        }
    }

    fn route(&self, record: &Record) -> usize {
        let count = self.capacity.len();
        match record {
            Record::Data(data) => (data.partition_hash() % count as u64) as usize,
            Record::Placeholder { .. } | Record::Finished { .. } => {
                self.next_placeholder_partition
                    .fetch_add(1, Ordering::Relaxed)
                    % count
            }
        }
    }

    async fn enqueue(&self, partition: usize, record: Record) -> PipelineResult<()> {
        match self.capacity[partition].acquire().await {
            // Returned to the semaphore when the record is released.
            Ok(permit) => permit.forget(),
            Err(_) => bail!(
                ErrorKind::ChannelClosed,
                "Pipeline channel is closed",
                format!("push to partition {partition} rejected")
            ),
        }

        let mut inner = self.inner.lock().await;
        if inner.closed {
            self.capacity[partition].add_permits(1);
            bail!(ErrorKind::ChannelClosed, "Pipeline channel is closed");
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.pending.insert(
            sequence,
            PendingAck {
                partition,
                position: record.position(),
                acked: false,
                data: None,
            },
        );
        inner.partitions[partition]
            .queue
            .push_back(Queued { sequence, record });
        drop(inner);

        self.notify.notify_waiters();

        Ok(())
    }
}

impl PipelineChannel for MultiplexChannel {
    async fn push(&self, records: Vec<Record>) -> PipelineResult<()> {
        for record in records {
            if record.is_finished() {
                for partition in 0..self.capacity.len() {
                    self.enqueue(partition, record.clone()).await?;
                }
                continue;
            }

            let partition = self.route(&record);
            self.enqueue(partition, record).await?;
        }

        Ok(())
    }

    async fn fetch(&self, batch_size: usize, timeout: Duration) -> PipelineResult<Vec<Record>> {
        let deadline = Instant::now() + timeout;
        let batch_size = batch_size.max(1);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Registers interest before checking, so a push between the check and the
            // wait is not missed.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if let Some(records) = inner.take_batch(batch_size) {
                    return Ok(records);
                }
                if inner.closed && inner.pending.is_empty() {
                    return Ok(Vec::new());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, records: Vec<Record>) -> PipelineResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let keys: Vec<RecordKey> = records.iter().map(RecordKey::from).collect();
        let mut inner = self.inner.lock().await;

        let Some(partition) = inner.find_in_flight(&records, &keys) else {
            bail!(
                ErrorKind::InvalidState,
                "Acknowledged records do not match any fetched batch",
                format!("{} records starting at {}", records.len(), keys[0].position)
            );
        };
        let Some(in_flight) = inner.partitions[partition].in_flight.take() else {
            bail!(ErrorKind::InvalidState, "Fetched batch vanished during ack");
        };

        for (sequence, record) in in_flight.sequences.into_iter().zip(records) {
            if let Some(pending) = inner.pending.get_mut(&sequence) {
                pending.acked = true;
                if let Record::Data(data) = record {
                    pending.data = Some(data);
                }
            }
        }

        let released = inner.release();
        for (partition, count) in released.freed.iter().enumerate() {
            if *count > 0 {
                self.capacity[partition].add_permits(*count);
            }
        }
        if !released.data.is_empty() {
            self.callback.on_ack(released.data);
        }
        for position in [
            released.last_inventory_position,
            released.last_wal_position,
        ]
        .into_iter()
        .flatten()
        {
            self.callback.on_acked_position(position);
        }
        debug!(partition, pending = inner.pending.len(), "batch acknowledged");
        drop(inner);

        self.notify.notify_waiters();

        Ok(())
    }

    fn partitions(&self) -> usize {
        self.capacity.len()
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if mem::replace(&mut inner.closed, true) {
            return;
        }

        let unreleased = inner.pending.len();
        drop(inner);

        if unreleased > 0 {
            warn!(unreleased, "pipeline channel closed with unacknowledged records");
        }
        for semaphore in &self.capacity {
            semaphore.close();
        }
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::types::{Column, OperationType, TableName, Value};

    #[derive(Default)]
    struct Collector {
        records: StdMutex<Vec<DataRecord>>,
        positions: StdMutex<Vec<Position>>,
    }

    impl AckCallback for Collector {
        fn on_ack(&self, records: Vec<DataRecord>) {
            self.records.lock().unwrap().extend(records);
        }

        fn on_acked_position(&self, position: Position) {
            self.positions.lock().unwrap().push(position);
        }
    }

    fn data(key: i64, position: u64) -> Record {
        let mut record = DataRecord::new(
            OperationType::Insert,
            TableName::new("public", "t_order"),
            Position::Wal(position),
        );
        record.after_row = vec![Column::new("id", Value::I64(key)).primary_key()];
        Record::Data(record)
    }

    fn finished(position: u64) -> Record {
        Record::Finished {
            position: Position::Wal(position),
        }
    }

    fn channel(partitions: usize, capacity: usize) -> (Arc<MultiplexChannel>, Arc<Collector>) {
        let collector = Arc::new(Collector::default());
        let channel = MultiplexChannel::new(partitions, capacity, collector.clone());
        (Arc::new(channel), collector)
    }

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_records_are_acked_in_source_order() {
        let (channel, collector) = channel(4, 16);
        let partitions = channel.partitions();

        let producer = {
            let channel = channel.clone();
            tokio::spawn(async move {
                for position in 1..=300u64 {
                    channel
                        .push(vec![data((position % 10) as i64, position)])
                        .await
                        .unwrap();
                }
                channel.push(vec![finished(301)]).await.unwrap();
            })
        };

        let finished_seen = Arc::new(AtomicUsize::new(0));
        let mut fetchers = Vec::new();
        for fetcher in 0..3usize {
            let channel = channel.clone();
            let finished_seen = finished_seen.clone();
            fetchers.push(tokio::spawn(async move {
                while finished_seen.load(Ordering::SeqCst) < partitions {
                    let records = channel.fetch(7, SHORT).await.unwrap();
                    for _ in 0..(records.len() + fetcher) % 4 {
                        tokio::task::yield_now().await;
                    }
                    let markers = records.iter().filter(|record| record.is_finished()).count();
                    channel.ack(records).await.unwrap();
                    finished_seen.fetch_add(markers, Ordering::SeqCst);
                }
            }));
        }

        producer.await.unwrap();
        for fetcher in fetchers {
            fetcher.await.unwrap();
        }

        let positions: Vec<u64> = collector
            .records
            .lock()
            .unwrap()
            .iter()
            .filter_map(|record| record.position.as_wal())
            .collect();
        assert_eq!(positions, (1..=300).collect::<Vec<_>>());
        assert_eq!(finished_seen.load(Ordering::SeqCst), partitions);
        assert_eq!(
            collector.positions.lock().unwrap().last(),
            Some(&Position::Wal(301))
        );
    }

    #[tokio::test]
    async fn finished_is_broadcast_after_partition_data() {
        let (channel, _collector) = channel(4, 100);
        let mut records: Vec<Record> = (1..=20u64).map(|position| data(position as i64, position)).collect();
        records.push(finished(21));
        channel.push(records).await.unwrap();

        let mut batches = Vec::new();
        loop {
            let batch = channel.fetch(1000, SHORT).await.unwrap();
            if batch.is_empty() {
                break;
            }
            channel.ack(batch.clone()).await.unwrap();
            batches.push(batch);
        }

        let markers = batches
            .iter()
            .flatten()
            .filter(|record| record.is_finished())
            .count();
        assert_eq!(markers, 4);

        let mut delivered = 0;
        for batch in &batches {
            assert!(batch.last().unwrap().is_finished());
            let hashes: Vec<u64> = batch
                .iter()
                .filter_map(|record| match record {
                    Record::Data(data) => Some(data.partition_hash() % 4),
                    _ => None,
                })
                .collect();
            assert!(hashes.windows(2).all(|pair| pair[0] == pair[1]));
            delivered += hashes.len();
        }
        assert_eq!(delivered, 20);
    }

    #[tokio::test]
    async fn partition_hands_out_one_batch_at_a_time() {
        let (channel, collector) = channel(1, 10);
        channel
            .push(vec![data(1, 1), data(1, 2), data(1, 3)])
            .await
            .unwrap();

        let first = channel.fetch(1, SHORT).await.unwrap();
        assert_eq!(first, vec![data(1, 1)]);
        assert!(channel.fetch(1, SHORT).await.unwrap().is_empty());

        channel.ack(first).await.unwrap();
        assert_eq!(channel.fetch(5, SHORT).await.unwrap(), vec![data(1, 2), data(1, 3)]);
        assert_eq!(collector.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn later_partition_waits_for_earlier_acks() {
        let (channel, collector) = channel(2, 10);
        // Keys chosen so the two records land in different partitions.
        let first = data(1, 1);
        let second = (2..100)
            .map(|key| data(key, 2))
            .find(|record| match (record, &first) {
                (Record::Data(a), Record::Data(b)) => a.partition_hash() % 2 != b.partition_hash() % 2,
                _ => false,
            })
            .unwrap();
        channel.push(vec![first.clone(), second.clone()]).await.unwrap();

        let batch_a = channel.fetch(10, SHORT).await.unwrap();
        let batch_b = channel.fetch(10, SHORT).await.unwrap();
        let (first_batch, second_batch) = if batch_a == vec![first.clone()] {
            (batch_a, batch_b)
        } else {
            (batch_b, batch_a)
        };

        channel.ack(second_batch).await.unwrap();
        assert!(collector.records.lock().unwrap().is_empty());

        channel.ack(first_batch).await.unwrap();
        let positions: Vec<Position> = collector
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|record| record.position)
            .collect();
        assert_eq!(positions, vec![Position::Wal(1), Position::Wal(2)]);
    }

    #[tokio::test]
    async fn placeholders_advance_acked_position_without_data() {
        let (channel, collector) = channel(2, 10);
        channel
            .push(vec![Record::Placeholder {
                position: Position::Wal(5),
            }])
            .await
            .unwrap();

        let batch = channel.fetch(10, SHORT).await.unwrap();
        channel.ack(batch).await.unwrap();

        assert!(collector.records.lock().unwrap().is_empty());
        assert_eq!(*collector.positions.lock().unwrap(), vec![Position::Wal(5)]);
    }

    #[tokio::test]
    async fn trailing_inventory_record_keeps_replication_position() {
        let (channel, collector) = channel(1, 10);
        let mut inventory = DataRecord::new(
            OperationType::Insert,
            TableName::new("public", "t_order"),
            Position::Inventory(1),
        );
        inventory.after_row = vec![Column::new("id", Value::I64(2)).primary_key()];
        channel
            .push(vec![data(1, 500), Record::Data(inventory)])
            .await
            .unwrap();

        let batch = channel.fetch(10, SHORT).await.unwrap();
        assert_eq!(batch.len(), 2);
        channel.ack(batch).await.unwrap();

        assert_eq!(collector.records.lock().unwrap().len(), 2);
        assert_eq!(
            *collector.positions.lock().unwrap(),
            vec![Position::Inventory(1), Position::Wal(500)]
        );
    }

    #[tokio::test]
    async fn push_waits_while_partition_is_full() {
        let (channel, _collector) = channel(1, 2);
        channel.push(vec![data(1, 1), data(1, 2)]).await.unwrap();

        let blocked = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.push(vec![data(1, 3)]).await })
        };
        tokio::time::sleep(SHORT).await;
        assert!(!blocked.is_finished());

        let batch = channel.fetch(10, SHORT).await.unwrap();
        channel.ack(batch).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn fetch_on_empty_channel_times_out() {
        let (channel, _collector) = channel(3, 10);

        let started = Instant::now();
        assert!(channel.fetch(10, SHORT).await.unwrap().is_empty());
        assert!(started.elapsed() >= SHORT);
    }

    #[tokio::test]
    async fn ack_of_unknown_batch_is_rejected() {
        let (channel, _collector) = channel(2, 10);

        let err = channel.ack(vec![data(1, 1)]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn closed_channel_rejects_push_and_wakes_producers() {
        let (channel, _collector) = channel(1, 1);
        channel.push(vec![data(1, 1)]).await.unwrap();

        let blocked = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.push(vec![data(1, 2)]).await })
        };
        tokio::time::sleep(SHORT).await;
        channel.close().await;

        let err = blocked.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelClosed);
        assert_eq!(
            channel.push(vec![data(1, 3)]).await.unwrap_err().kind(),
            ErrorKind::ChannelClosed
        );
    }
}
