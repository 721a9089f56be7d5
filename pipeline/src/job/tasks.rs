use std::sync::Arc;

use tracing::info;

use crate::channel::{AckCallback, Channel, PipelineChannel, create_channel};
use crate::concurrency::stop::{StopTx, create_stop_signal};
use crate::error::PipelineResult;
use crate::ingest::{IncrementalDumper, InventoryDumper, InventorySource, ReplicationSource};
use crate::job::{DrainTracker, Importer, JobItemContext, PipelineTask, PipelineTasksRunner};
use crate::metadata::MetadataLoader;
use crate::sink::Sink;
use crate::types::TableName;
use crate::wal::{DecodingPlugin, WalEventConverter};

/// Assembles the tasks of one shard item around a single pipeline channel.
///
/// Dumpers push into the channel, one importer per channel partition drains it into the
/// sink, and the [`JobItemContext`] receives every acknowledgement.
pub struct TasksRunnerBuilder {
    context: Arc<JobItemContext>,
    channel: Arc<Channel>,
    stop_tx: StopTx,
    tasks: Vec<(String, PipelineTask)>,
    producers: usize,
    inventory_tasks: usize,
}

impl TasksRunnerBuilder {
    pub fn new(context: Arc<JobItemContext>) -> Self {
        let callback: Arc<dyn AckCallback> = context.clone();
        let channel = Arc::new(create_channel(&context.job_config().channel, callback));
        let (stop_tx, _) = create_stop_signal();

        Self {
            context,
            channel,
            stop_tx,
            tasks: Vec::new(),
            producers: 0,
            inventory_tasks: 0,
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Adds the task following the replication slot of the shard item.
    pub fn with_incremental<S, M>(
        mut self,
        source: S,
        decoder: Arc<dyn DecodingPlugin>,
        metadata_loader: Arc<M>,
    ) -> Self
    where
        S: ReplicationSource + 'static,
        M: MetadataLoader + Send + Sync + 'static,
    {
        let converter = WalEventConverter::new(self.context.tables().iter().cloned(), metadata_loader);
        let mut dumper = IncrementalDumper::new(
            self.context.slot_name().to_string(),
            self.context.job_config().incremental.clone(),
            source,
            decoder,
            converter,
            self.channel.clone(),
            self.context.acked_lsn(),
            self.context.resume_lsn(),
            self.stop_tx.subscribe(),
        );

        self.producers += 1;
        self.tasks.push((
            "incremental_dumper".to_string(),
            Box::pin(async move { dumper.run().await }),
        ));

        self
    }

    /// Adds a task copying the existing rows of `table_name`, reading from the source that
    /// `source` resolves to once the task runs.
    ///
    /// Skipped when the inventory is disabled or already finished by a previous execution.
    pub fn with_inventory<F, I>(mut self, table_name: &TableName, source: F) -> Self
    where
        F: Future<Output = PipelineResult<I>> + Send + 'static,
        I: InventorySource + 'static,
    {
        let inventory = &self.context.job_config().inventory;
        if !inventory.enabled || self.context.is_inventory_finished() {
            return self;
        }

        let context = self.context.clone();
        let channel = self.channel.clone();
        let batch_size = inventory.batch_size;
        let stop_rx = self.stop_tx.subscribe();

        self.producers += 1;
        self.inventory_tasks += 1;
        self.tasks.push((
            format!("inventory_dumper_{table_name}"),
            Box::pin(async move {
                let source = source.await?;
                let mut dumper = InventoryDumper::new(
                    source,
                    channel,
                    batch_size,
                    context.inventory_pushed(),
                    stop_rx,
                );
                dumper.run().await?;

                if dumper.is_finished() {
                    context.finish_inventory_task();
                }

                Ok(())
            }),
        ));

        self
    }

    /// Adds one importer per channel partition writing to `sink` and returns the runner.
    pub fn build<K>(self, sink: K) -> PipelineTasksRunner
    where
        K: Sink + Clone + Send + Sync + 'static,
    {
        let partitions = self.channel.partitions();
        let drain = Arc::new(DrainTracker::new(self.producers, partitions));
        let batch = self.context.job_config().batch.clone();

        info!(
            job_id = self.context.job_id(),
            shard_item = self.context.shard_item(),
            producers = self.producers,
            partitions,
            "building shard item tasks"
        );

        let mut runner = PipelineTasksRunner::new(self.context.clone(), self.stop_tx.clone())
            .with_channel(self.channel.clone())
            .with_inventory_tasks(self.inventory_tasks);

        for (name, task) in self.tasks {
            runner = runner.with_task(name, task);
        }

        for partition in 0..partitions {
            let importer = Importer::new(
                self.channel.clone(),
                sink.clone(),
                batch.clone(),
                drain.clone(),
                self.stop_tx.subscribe(),
            );
            runner = runner.with_task(format!("importer_{partition}"), async move {
                importer.run().await
            });
        }

        runner
    }
}
