use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use config::shared::JobConfig;
use tokio::sync::Notify;

use crate::bail;
use crate::concurrency::stop::create_stop_signal;
use crate::conversions::timestamp::IsoTimestampParser;
use crate::error::{ErrorKind, PipelineResult};
use crate::job::{JobItemContext, PipelineJob, PipelineTasksRunner, TasksRunnerBuilder};
use crate::metadata::MemoryMetadataLoader;
use crate::sink::memory::MemorySink;
use crate::test_utils::notify::TimedNotify;
use crate::test_utils::source::{ScriptedInventorySource, ScriptedReplicationSource};
use crate::types::{Column, TableMetadata, TableName};
use crate::wal::build_decoding_plugin;

/// What the single task of a [`TestJob`] runner does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestTaskBehavior {
    Complete,
    Fail(ErrorKind),
    /// Runs until stop is requested and then fails.
    FailOnStop(ErrorKind),
    RunUntilStop,
}

/// [`PipelineJob`] whose runners run one task with a fixed behavior.
pub struct TestJob {
    config: Arc<JobConfig>,
    behavior: TestTaskBehavior,
    prepare_failure: Option<ErrorKind>,
    task_started: Arc<Notify>,
    built_runners: AtomicUsize,
}

impl TestJob {
    pub fn new(config: JobConfig, behavior: TestTaskBehavior) -> Self {
        Self {
            config: Arc::new(config),
            behavior,
            prepare_failure: None,
            task_started: Arc::new(Notify::new()),
            built_runners: AtomicUsize::new(0),
        }
    }

    pub fn with_prepare_failure(mut self, kind: ErrorKind) -> Self {
        self.prepare_failure = Some(kind);
        self
    }

    /// Fired every time a task starts running.
    pub fn task_started(&self) -> TimedNotify {
        TimedNotify::new(self.task_started.clone(), "task start")
    }

    pub fn built_runners(&self) -> usize {
        self.built_runners.load(Ordering::SeqCst)
    }
}

impl PipelineJob for TestJob {
    type Runner = PipelineTasksRunner;

    fn job_config(&self, job_id: &str) -> PipelineResult<Arc<JobConfig>> {
        if job_id != self.config.job_id {
            bail!(ErrorKind::ConfigError, "Job is not configured");
        }

        Ok(self.config.clone())
    }

    async fn prepare(&self, _context: &Arc<JobItemContext>) -> PipelineResult<()> {
        if let Some(kind) = self.prepare_failure {
            bail!(kind, "Scripted preparation failure");
        }

        Ok(())
    }

    fn build_runner(&self, context: Arc<JobItemContext>) -> PipelineResult<PipelineTasksRunner> {
        self.built_runners.fetch_add(1, Ordering::SeqCst);

        let (stop_tx, _) = create_stop_signal();
        let mut stop_rx = stop_tx.subscribe();
        let behavior = self.behavior;
        let task_started = self.task_started.clone();

        let runner = PipelineTasksRunner::new(context, stop_tx).with_task("test_task", async move {
            task_started.notify_one();

            match behavior {
                TestTaskBehavior::Complete => Ok(()),
                TestTaskBehavior::Fail(kind) => bail!(kind, "Scripted task failure"),
                TestTaskBehavior::FailOnStop(kind) => {
                    stop_rx.stopped().await;
                    bail!(kind, "Scripted task failure on stop");
                }
                TestTaskBehavior::RunUntilStop => {
                    stop_rx.stopped().await;
                    Ok(())
                }
            }
        });

        Ok(runner)
    }
}

/// [`PipelineJob`] running the real dumpers and importers over scripted sources.
///
/// Every shard item replays the same replication payloads and copies the same rows per
/// table. Records end up in a shared [`MemorySink`].
pub struct ScriptedPipelineJob {
    config: Arc<JobConfig>,
    replication: ScriptedReplicationSource,
    inventory_rows: HashMap<TableName, Vec<Vec<Column>>>,
    metadata_loader: Arc<MemoryMetadataLoader>,
    sink: MemorySink,
}

impl ScriptedPipelineJob {
    pub fn new(
        config: JobConfig,
        replication: ScriptedReplicationSource,
        tables: impl IntoIterator<Item = TableMetadata>,
        sink: MemorySink,
    ) -> Self {
        Self {
            config: Arc::new(config),
            replication,
            inventory_rows: HashMap::new(),
            metadata_loader: Arc::new(MemoryMetadataLoader::new(tables)),
            sink,
        }
    }

    pub fn with_inventory_rows(mut self, table_name: TableName, rows: Vec<Vec<Column>>) -> Self {
        self.inventory_rows.insert(table_name, rows);
        self
    }
}

impl PipelineJob for ScriptedPipelineJob {
    type Runner = PipelineTasksRunner;

    fn job_config(&self, job_id: &str) -> PipelineResult<Arc<JobConfig>> {
        if job_id != self.config.job_id {
            bail!(ErrorKind::ConfigError, "Job is not configured");
        }

        Ok(self.config.clone())
    }

    async fn prepare(&self, _context: &Arc<JobItemContext>) -> PipelineResult<()> {
        Ok(())
    }

    fn build_runner(&self, context: Arc<JobItemContext>) -> PipelineResult<PipelineTasksRunner> {
        let decoder = build_decoding_plugin(
            self.config.incremental.plugin,
            Arc::new(IsoTimestampParser),
        );

        let mut builder = TasksRunnerBuilder::new(context.clone()).with_incremental(
            self.replication.clone(),
            decoder,
            self.metadata_loader.clone(),
        );

        for table_name in context.tables() {
            let rows = self
                .inventory_rows
                .get(table_name)
                .cloned()
                .unwrap_or_default();
            let source = ScriptedInventorySource::new(table_name.clone(), rows);

            builder = builder.with_inventory(table_name, async move { Ok(source) });
        }

        Ok(builder.build(self.sink.clone()))
    }
}
