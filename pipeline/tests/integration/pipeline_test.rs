use std::sync::Arc;
use std::time::Duration;

use config::shared::JobConfig;
use pipeline::error::ErrorKind;
use pipeline::job::{JobExecutor, JobItemProgress, JobStatus};
use pipeline::sink::memory::MemorySink;
use pipeline::store::ProgressStore;
use pipeline::test_utils::config::test_job_config;
use pipeline::test_utils::job::ScriptedPipelineJob;
use pipeline::test_utils::source::ScriptedReplicationSource;
use pipeline::test_utils::store::NotifyingProgressStore;
use pipeline::types::{
    Column, ColumnMetadata, OperationType, Position, TableMetadata, TableName, Value,
};
use telemetry::tracing::init_test_tracing;

fn order_table() -> TableMetadata {
    let column = |name: &str, type_name: &str, is_primary_key: bool| ColumnMetadata {
        name: name.to_string(),
        type_name: type_name.to_string(),
        is_primary_key,
        is_unique_key: false,
    };

    TableMetadata {
        table_name: TableName::new("public", "t_order"),
        columns: vec![column("id", "integer", true), column("status", "text", false)],
    }
}

fn order_row(id: i64, status: &str) -> Vec<Column> {
    vec![
        Column::new("id", Value::I64(id)).primary_key(),
        Column::new("status", Value::from(status)),
    ]
}

fn replicated_changes() -> ScriptedReplicationSource {
    ScriptedReplicationSource::new([
        (
            100,
            "table public.t_order: INSERT: id[integer]:4 status[text]:'new'",
        ),
        (
            110,
            "table public.t_order: UPDATE: id[integer]:1 status[text]:'paid'",
        ),
    ])
}

fn executor(
    job: ScriptedPipelineJob,
    store: NotifyingProgressStore,
) -> Arc<JobExecutor<ScriptedPipelineJob, NotifyingProgressStore>> {
    Arc::new(
        JobExecutor::new(Arc::new(job), Arc::new(store))
            .with_persist_interval(Duration::from_millis(1)),
    )
}

fn caught_up(progress: &JobItemProgress) -> bool {
    progress.inventory_finished
        && progress.position == Some(Position::Wal(110))
        && progress.processed_records_count == 5
}

async fn run_until_caught_up(config: JobConfig, store: NotifyingProgressStore, sink: MemorySink) {
    let job = ScriptedPipelineJob::new(config, replicated_changes(), [order_table()], sink)
        .with_inventory_rows(
            TableName::new("public", "t_order"),
            vec![order_row(1, "new"), order_row(2, "new"), order_row(3, "new")],
        );
    let reached = store.notify_on_progress("j1", 0, caught_up).await;
    let executor = executor(job, store);

    let execution = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute("j1", 0).await }
    });

    reached.notified().await;
    executor.stop_job("j1").await.unwrap();
    execution.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn inventory_and_replicated_changes_reach_the_sink() {
    init_test_tracing();
    let store = NotifyingProgressStore::new();
    let sink = MemorySink::new();

    run_until_caught_up(test_job_config("j1", 1), store.clone(), sink.clone()).await;

    let records = sink.records().await;
    assert_eq!(records.len(), 5);

    let inventory: Vec<_> = records
        .iter()
        .filter(|record| matches!(record.position, Position::Inventory(_)))
        .collect();
    assert_eq!(inventory.len(), 3);
    assert!(
        inventory
            .iter()
            .all(|record| record.operation == OperationType::Insert)
    );

    let update = records
        .iter()
        .find(|record| record.operation == OperationType::Update)
        .unwrap();
    assert_eq!(update.position, Position::Wal(110));
    assert_eq!(update.column("status").unwrap().value, Value::from("paid"));

    let progress = store.load_progress("j1", 0).await.unwrap().unwrap();
    assert_eq!(progress.status, JobStatus::ExecuteIncrementalTask);
    assert_eq!(progress.inventory_records_count, 3);
    assert!(caught_up(&progress));
    assert!(store.load_error("j1", 0).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_skips_finished_inventory_and_keeps_counters() {
    init_test_tracing();
    let store = NotifyingProgressStore::new();
    let sink = MemorySink::new();
    run_until_caught_up(test_job_config("j1", 1), store.clone(), sink.clone()).await;
    sink.clear().await;

    // The slot is now held elsewhere, so the restarted item drains and completes.
    let job = ScriptedPipelineJob::new(
        test_job_config("j1", 1),
        ScriptedReplicationSource::idle().with_end_error(ErrorKind::ReplicationSlotAlreadyActive),
        [order_table()],
        sink.clone(),
    )
    .with_inventory_rows(
        TableName::new("public", "t_order"),
        vec![order_row(1, "new")],
    );
    let executor = executor(job, store.clone());

    tokio::time::timeout(Duration::from_secs(10), executor.execute("j1", 0))
        .await
        .unwrap()
        .unwrap();

    assert!(sink.records().await.is_empty());
    let progress = store.load_progress("j1", 0).await.unwrap().unwrap();
    assert_eq!(progress.status, JobStatus::Finished);
    assert_eq!(progress.processed_records_count, 5);
    assert_eq!(progress.inventory_records_count, 3);
    assert_eq!(progress.position, Some(Position::Wal(110)));
}

#[tokio::test(flavor = "multi_thread")]
async fn replicated_changes_keep_source_order_per_row() {
    init_test_tracing();
    let mut config = test_job_config("j1", 1);
    config.inventory.enabled = false;
    config.channel.partitions = 4;
    config.batch.max_size = 1;

    let payloads: Vec<(u64, String)> = (1..=40)
        .map(|n| {
            let id = n % 5;
            (
                n * 10,
                format!("table public.t_order: UPDATE: id[integer]:{id} status[text]:'v{n}'"),
            )
        })
        .collect();
    let source = ScriptedReplicationSource::new(payloads)
        .with_end_error(ErrorKind::ReplicationSlotAlreadyActive);
    let sink = MemorySink::new();
    let store = NotifyingProgressStore::new();
    let executor = executor(
        ScriptedPipelineJob::new(config, source, [order_table()], sink.clone()),
        store.clone(),
    );

    tokio::time::timeout(Duration::from_secs(10), executor.execute("j1", 0))
        .await
        .unwrap()
        .unwrap();

    let records = sink.records().await;
    assert_eq!(records.len(), 40);
    for id in 0..5 {
        let positions: Vec<_> = records
            .iter()
            .filter(|record| record.column("id").unwrap().value == Value::I64(id))
            .map(|record| record.position)
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    let progress = store.load_progress("j1", 0).await.unwrap().unwrap();
    // The finished marker sits one past the last change.
    assert_eq!(progress.position, Some(Position::Wal(401)));
    assert_eq!(progress.processed_records_count, 40);
}
