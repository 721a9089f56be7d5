use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use config::shared::{IntoConnectOptions, JobConfig};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{Notify, watch};
use tracing::info;

use crate::channel::AckCallback;
use crate::error::PipelineResult;
use crate::ingest::AckedLsn;
use crate::job::{JobItemProgress, JobStatus};
use crate::metadata::PgMetadataLoader;
use crate::types::{DataRecord, Position, TableName};

/// Connections of the lazily created source pool.
const SOURCE_POOL_MAX_CONNECTIONS: u32 = 4;

/// Shared state of one running job shard item.
///
/// Created per execution and shared read-only by every task of the item. Counters start
/// from the persisted progress and only move through atomic adds.
pub struct JobItemContext {
    job_config: Arc<JobConfig>,
    shard_item: u32,
    slot_name: String,
    tables: Vec<TableName>,
    status: watch::Sender<JobStatus>,
    position: watch::Sender<Option<Position>>,
    initial_progress: JobItemProgress,
    processed_records: AtomicU64,
    inventory_pushed: Arc<AtomicU64>,
    inventory_acked: AtomicU64,
    remaining_inventory_tasks: AtomicUsize,
    inventory_finished: AtomicBool,
    acked_lsn: AckedLsn,
    source_pool: OnceLock<PgPool>,
    metadata_loader: OnceLock<Arc<PgMetadataLoader>>,
    persist_notify: Notify,
}

impl JobItemContext {
    pub fn new(
        job_config: Arc<JobConfig>,
        shard_item: u32,
        slot_name: String,
        progress: Option<JobItemProgress>,
    ) -> PipelineResult<Self> {
        let tables = job_config
            .shard(shard_item)?
            .tables
            .iter()
            .map(|table| TableName::parse(table))
            .collect();

        let initial_progress = progress.unwrap_or_default();
        let acked_lsn = initial_progress
            .position
            .and_then(|position| position.as_wal())
            .unwrap_or_default();

        Ok(Self {
            job_config,
            shard_item,
            slot_name,
            tables,
            status: watch::Sender::new(JobStatus::Preparing),
            position: watch::Sender::new(initial_progress.position),
            processed_records: AtomicU64::new(initial_progress.processed_records_count),
            inventory_pushed: Arc::new(AtomicU64::new(0)),
            inventory_acked: AtomicU64::new(0),
            remaining_inventory_tasks: AtomicUsize::new(0),
            inventory_finished: AtomicBool::new(initial_progress.inventory_finished),
            acked_lsn: AckedLsn::new(acked_lsn),
            source_pool: OnceLock::new(),
            metadata_loader: OnceLock::new(),
            persist_notify: Notify::new(),
            initial_progress,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_config.job_id
    }

    pub fn shard_item(&self) -> u32 {
        self.shard_item
    }

    pub fn job_config(&self) -> &Arc<JobConfig> {
        &self.job_config
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    pub fn tables(&self) -> &[TableName] {
        &self.tables
    }

    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    pub fn set_status(&self, status: JobStatus) {
        self.status.send_replace(status);
    }

    /// Last acknowledged replication position.
    pub fn position(&self) -> Option<Position> {
        *self.position.borrow()
    }

    /// Replication position a restarted dumper resumes from.
    pub fn resume_lsn(&self) -> Option<u64> {
        self.initial_progress
            .position
            .and_then(|position| position.as_wal())
    }

    pub fn acked_lsn(&self) -> AckedLsn {
        self.acked_lsn.clone()
    }

    pub fn processed_records_count(&self) -> u64 {
        self.processed_records.load(Ordering::Relaxed)
    }

    /// Counter incremented by inventory dumpers for every pushed row.
    pub fn inventory_pushed(&self) -> Arc<AtomicU64> {
        self.inventory_pushed.clone()
    }

    pub fn is_inventory_finished(&self) -> bool {
        self.inventory_finished.load(Ordering::Acquire)
    }

    /// Declares how many inventory tasks run in this execution. Zero marks the inventory
    /// as finished right away.
    pub fn set_inventory_tasks(&self, count: usize) {
        self.remaining_inventory_tasks.store(count, Ordering::Release);
        self.check_inventory_finished();
    }

    /// Called by an inventory task once every row of its table was pushed.
    pub fn finish_inventory_task(&self) {
        let _ = self.remaining_inventory_tasks.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |remaining| remaining.checked_sub(1),
        );
        self.check_inventory_finished();
    }

    /// The inventory is finished once every inventory task is done and every row they
    /// pushed has been acknowledged.
    fn check_inventory_finished(&self) {
        if self.remaining_inventory_tasks.load(Ordering::Acquire) != 0 {
            return;
        }
        if self.inventory_acked.load(Ordering::Acquire)
            < self.inventory_pushed.load(Ordering::Acquire)
        {
            return;
        }
        if self.inventory_finished.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(
            job_id = self.job_id(),
            shard_item = self.shard_item,
            "inventory tasks finished"
        );

        self.set_status(JobStatus::ExecuteIncrementalTask);
        self.notify_persist();
    }

    /// Snapshot of the progress to persist.
    pub fn progress(&self) -> JobItemProgress {
        JobItemProgress {
            status: self.status(),
            position: self.position(),
            inventory_finished: self.is_inventory_finished(),
            processed_records_count: self.processed_records_count(),
            inventory_records_count: self.initial_progress.inventory_records_count
                + self.inventory_acked.load(Ordering::Relaxed),
        }
    }

    /// Asks the progress persister to write a fresh snapshot.
    pub fn notify_persist(&self) {
        self.persist_notify.notify_one();
    }

    pub async fn persist_notified(&self) {
        self.persist_notify.notified().await;
    }

    /// Pool on the source database, created on first use.
    pub fn source_pool(&self) -> &PgPool {
        self.source_pool.get_or_init(|| {
            PgPoolOptions::new()
                .max_connections(SOURCE_POOL_MAX_CONNECTIONS)
                .connect_lazy_with(self.job_config.source.with_db())
        })
    }

    /// Closes the source pool if a task created it. Called once the tasks of the item
    /// have exited.
    pub async fn close_source(&self) {
        if let Some(pool) = self.source_pool.get() {
            pool.close().await;
            info!(
                job_id = self.job_id(),
                shard_item = self.shard_item,
                "source pool closed"
            );
        }
    }

    pub fn has_source_pool(&self) -> bool {
        self.source_pool.get().is_some()
    }

    /// Metadata loader on [`JobItemContext::source_pool`], created on first use.
    pub fn metadata_loader(&self) -> Arc<PgMetadataLoader> {
        self.metadata_loader
            .get_or_init(|| Arc::new(PgMetadataLoader::new(self.source_pool().clone())))
            .clone()
    }
}

impl AckCallback for JobItemContext {
    fn on_ack(&self, records: Vec<DataRecord>) {
        let inventory = records
            .iter()
            .filter(|record| matches!(record.position, Position::Inventory(_)))
            .count() as u64;

        self.processed_records
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        if inventory > 0 {
            self.inventory_acked.fetch_add(inventory, Ordering::AcqRel);
            self.check_inventory_finished();
        }
    }

    fn on_acked_position(&self, position: Position) {
        // Inventory positions are per table and say nothing about the replication stream.
        let Position::Wal(lsn) = position else {
            return;
        };

        self.acked_lsn.advance(lsn);
        self.position.send_if_modified(|current| match current {
            Some(Position::Wal(current_lsn)) if *current_lsn >= lsn => false,
            _ => {
                *current = Some(position);
                true
            }
        });
        self.notify_persist();
    }
}

impl std::fmt::Debug for JobItemContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobItemContext")
            .field("job_id", &self.job_id())
            .field("shard_item", &self.shard_item)
            .field("slot_name", &self.slot_name)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::{MultiplexChannel, PipelineChannel};
    use crate::test_utils::config::test_job_config;
    use crate::types::{OperationType, Record};

    fn record(position: Position) -> DataRecord {
        DataRecord::new(
            OperationType::Insert,
            TableName::new("public", "t_order"),
            position,
        )
    }

    #[test]
    fn counters_are_seeded_from_progress() {
        let progress = JobItemProgress {
            status: JobStatus::ExecuteIncrementalTask,
            position: Some(Position::Wal(500)),
            inventory_finished: true,
            processed_records_count: 10,
            inventory_records_count: 4,
        };
        let context = JobItemContext::new(
            Arc::new(test_job_config("j1", 1)),
            0,
            "slot".to_string(),
            Some(progress),
        )
        .unwrap();

        context.on_ack(vec![record(Position::Wal(600))]);
        context.on_acked_position(Position::Wal(600));

        let snapshot = context.progress();
        assert_eq!(snapshot.processed_records_count, 11);
        assert_eq!(snapshot.inventory_records_count, 4);
        assert_eq!(snapshot.position, Some(Position::Wal(600)));
        assert!(snapshot.inventory_finished);
        assert_eq!(context.resume_lsn(), Some(500));
        assert_eq!(context.acked_lsn().get(), 600);
    }

    #[test]
    fn unknown_shard_item_is_rejected() {
        let result = JobItemContext::new(
            Arc::new(test_job_config("j1", 1)),
            5,
            "slot".to_string(),
            None,
        );

        assert!(result.is_err());
    }

    #[test]
    fn acked_position_never_moves_backwards() {
        let context =
            JobItemContext::new(Arc::new(test_job_config("j1", 1)), 0, "s".into(), None).unwrap();

        context.on_acked_position(Position::Wal(20));
        context.on_acked_position(Position::Wal(10));
        context.on_acked_position(Position::Inventory(99));

        assert_eq!(context.position(), Some(Position::Wal(20)));
    }

    #[test]
    fn inventory_finishes_after_tasks_and_acks() {
        let context =
            JobItemContext::new(Arc::new(test_job_config("j1", 1)), 0, "s".into(), None).unwrap();
        context.set_inventory_tasks(2);
        context.inventory_pushed().fetch_add(2, Ordering::Relaxed);

        context.finish_inventory_task();
        context.finish_inventory_task();
        assert!(!context.is_inventory_finished());

        context.on_ack(vec![
            record(Position::Inventory(1)),
            record(Position::Inventory(2)),
        ]);
        assert!(context.is_inventory_finished());
        assert_eq!(context.status(), JobStatus::ExecuteIncrementalTask);
        assert_eq!(context.progress().inventory_records_count, 2);
    }

    #[tokio::test]
    async fn replication_position_survives_shared_inventory_release() {
        let context = Arc::new(
            JobItemContext::new(Arc::new(test_job_config("j1", 1)), 0, "s".into(), None).unwrap(),
        );
        let channel = MultiplexChannel::new(1, 10, context.clone());

        channel
            .push(vec![
                Record::Data(record(Position::Wal(500))),
                Record::Data(record(Position::Inventory(1))),
            ])
            .await
            .unwrap();
        let batch = channel.fetch(10, Duration::from_millis(50)).await.unwrap();
        channel.ack(batch).await.unwrap();

        assert_eq!(context.position(), Some(Position::Wal(500)));
        assert_eq!(context.acked_lsn().get(), 500);
        assert_eq!(context.processed_records_count(), 2);
    }

    #[tokio::test]
    async fn close_source_closes_created_pool() {
        let context =
            JobItemContext::new(Arc::new(test_job_config("j1", 1)), 0, "s".into(), None).unwrap();
        context.close_source().await;
        assert!(!context.has_source_pool());

        let pool = context.source_pool().clone();
        assert!(!pool.is_closed());

        context.close_source().await;

        assert!(pool.is_closed());
        assert!(context.source_pool().is_closed());
    }

    #[tokio::test]
    async fn position_update_requests_persist() {
        let context =
            JobItemContext::new(Arc::new(test_job_config("j1", 1)), 0, "s".into(), None).unwrap();

        context.on_acked_position(Position::Wal(1));

        tokio::time::timeout(Duration::from_secs(1), context.persist_notified())
            .await
            .unwrap();
    }
}
