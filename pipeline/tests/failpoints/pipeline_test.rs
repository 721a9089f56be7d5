use std::sync::Arc;
use std::time::Duration;

use pipeline::error::ErrorKind;
use pipeline::failpoints::{
    IMPORTER_BEFORE_ACK, PROGRESS_PERSISTER_BEFORE_PERSIST, TASKS_RUNNER_BEFORE_START,
};
use pipeline::job::{JobExecutor, JobStatus};
use pipeline::sink::memory::MemorySink;
use pipeline::store::ProgressStore;
use pipeline::test_utils::config::test_job_config;
use pipeline::test_utils::failpoints::CustomFailScenario;
use pipeline::test_utils::job::ScriptedPipelineJob;
use pipeline::test_utils::source::ScriptedReplicationSource;
use pipeline::test_utils::store::NotifyingProgressStore;
use pipeline::types::{ColumnMetadata, TableMetadata, TableName};
use telemetry::tracing::init_test_tracing;

fn order_table() -> TableMetadata {
    TableMetadata {
        table_name: TableName::new("public", "t_order"),
        columns: vec![
            ColumnMetadata {
                name: "id".to_string(),
                type_name: "integer".to_string(),
                is_primary_key: true,
                is_unique_key: false,
            },
            ColumnMetadata {
                name: "status".to_string(),
                type_name: "text".to_string(),
                is_primary_key: false,
                is_unique_key: false,
            },
        ],
    }
}

fn executor(
    sink: MemorySink,
    store: NotifyingProgressStore,
) -> JobExecutor<ScriptedPipelineJob, NotifyingProgressStore> {
    let mut config = test_job_config("j1", 1);
    config.inventory.enabled = false;

    let source = ScriptedReplicationSource::new([
        (
            100,
            "table public.t_order: INSERT: id[integer]:1 status[text]:'new'",
        ),
        (
            110,
            "table public.t_order: INSERT: id[integer]:2 status[text]:'new'",
        ),
    ]);
    let job = ScriptedPipelineJob::new(config, source, [order_table()], sink);

    JobExecutor::new(Arc::new(job), Arc::new(store))
        .with_persist_interval(Duration::from_millis(1))
}

#[tokio::test(flavor = "multi_thread")]
async fn importer_failure_before_ack_fails_the_shard_item() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(IMPORTER_BEFORE_ACK, "return")]);

    let sink = MemorySink::new();
    let store = NotifyingProgressStore::new();
    let executor = executor(sink.clone(), store.clone());

    let err = tokio::time::timeout(Duration::from_secs(10), executor.execute("j1", 0))
        .await
        .unwrap()
        .unwrap_err();

    assert!(err.kinds().contains(&ErrorKind::Injected));
    // Records were written but never acknowledged, so no position moved forward.
    assert!(!sink.records().await.is_empty());
    let progress = store.load_progress("j1", 0).await.unwrap().unwrap();
    assert_eq!(progress.status, JobStatus::ExecuteFailure);
    assert_eq!(progress.position, None);
    assert_eq!(progress.processed_records_count, 0);
    assert_eq!(store.memory().error_history("j1", 0).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn source_io_failure_is_reported_with_its_kind() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(IMPORTER_BEFORE_ACK, "return(source_io)")]);

    let store = NotifyingProgressStore::new();
    let executor = executor(MemorySink::new(), store.clone());

    let err = tokio::time::timeout(Duration::from_secs(10), executor.execute("j1", 0))
        .await
        .unwrap()
        .unwrap_err();

    assert!(err.kinds().contains(&ErrorKind::SourceIoError));
    assert!(store.load_error("j1", 0).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_before_start_leaves_the_sink_untouched() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(TASKS_RUNNER_BEFORE_START, "return(sink)")]);

    let sink = MemorySink::new();
    let store = NotifyingProgressStore::new();
    let executor = executor(sink.clone(), store.clone());

    let err = executor.execute("j1", 0).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SinkError);
    assert!(sink.records().await.is_empty());
    let progress = store.load_progress("j1", 0).await.unwrap().unwrap();
    assert_eq!(progress.status, JobStatus::ExecuteFailure);
    assert!(executor.runner_manager("j1").unwrap().shard_items().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_write_failure_fails_the_shard_item() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(PROGRESS_PERSISTER_BEFORE_PERSIST, "return")]);

    let store = NotifyingProgressStore::new();
    let executor = executor(MemorySink::new(), store.clone());

    let err = tokio::time::timeout(Duration::from_secs(10), executor.execute("j1", 0))
        .await
        .unwrap()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Injected);
    assert!(store.load_progress("j1", 0).await.unwrap().is_none());
    assert_eq!(store.memory().error_history("j1", 0).await.len(), 1);
}
