use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use config::shared::JobConfig;
use postgres::replication::fetch_source_prerequisites;
use tracing::info;

use crate::conversions::timestamp::{IsoTimestampParser, TimestampParser};
use crate::error::{ErrorKind, PipelineResult};
use crate::ingest::{PgInventorySource, PgReplicationSource};
use crate::job::{JobItemContext, PipelineJob, PipelineTasksRunner, TasksRunnerBuilder};
use crate::metadata::MetadataLoader;
use crate::sink::Sink;
use crate::wal::build_decoding_plugin;
use crate::{bail, pipeline_error};

/// [`PipelineJob`] migrating Postgres compatible sources into a [`Sink`].
#[derive(Debug)]
pub struct PgPipelineJob<K> {
    jobs: HashMap<String, Arc<JobConfig>>,
    sink: K,
}

impl<K> PgPipelineJob<K> {
    pub fn new(jobs: impl IntoIterator<Item = JobConfig>, sink: K) -> Self {
        let jobs = jobs
            .into_iter()
            .map(|job| (job.job_id.clone(), Arc::new(job)))
            .collect();

        Self { jobs, sink }
    }

    pub fn job_ids(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}

impl<K> PipelineJob for PgPipelineJob<K>
where
    K: Sink + Clone + Send + Sync + 'static,
{
    type Runner = PipelineTasksRunner;

    fn job_config(&self, job_id: &str) -> PipelineResult<Arc<JobConfig>> {
        self.jobs.get(job_id).cloned().ok_or_else(|| {
            pipeline_error!(
                ErrorKind::ConfigError,
                "Job is not configured",
                format!("No configuration found for job '{job_id}'")
            )
        })
    }

    async fn prepare(&self, context: &Arc<JobItemContext>) -> PipelineResult<()> {
        let prerequisites = fetch_source_prerequisites(context.source_pool()).await?;

        if !prerequisites.has_logical_wal_level() {
            bail!(
                ErrorKind::SourceError,
                "Source does not support logical replication",
                format!(
                    "wal_level is '{}', logical replication requires 'logical'",
                    prerequisites.wal_level
                )
            );
        }
        if !prerequisites.can_replicate {
            bail!(
                ErrorKind::AuthenticationError,
                "Source user cannot replicate",
                format!(
                    "User '{}' needs the replication attribute",
                    context.job_config().source.username
                )
            );
        }
        if prerequisites.max_replication_slots <= 0 {
            bail!(
                ErrorKind::SourceError,
                "Source has no replication slots",
                "max_replication_slots must be greater than zero"
            );
        }

        info!(
            job_id = context.job_id(),
            shard_item = context.shard_item(),
            "source prerequisites checked"
        );

        Ok(())
    }

    fn build_runner(&self, context: Arc<JobItemContext>) -> PipelineResult<PipelineTasksRunner> {
        let config = context.job_config().clone();
        let timestamp_parser: Arc<dyn TimestampParser> = Arc::new(IsoTimestampParser);

        let source = PgReplicationSource::new(
            config.source.clone(),
            config.incremental.plugin,
            Duration::from_millis(config.incremental.status_interval_ms),
        );
        let decoder = build_decoding_plugin(config.incremental.plugin, timestamp_parser.clone());

        let mut builder = TasksRunnerBuilder::new(context.clone()).with_incremental(
            source,
            decoder,
            context.metadata_loader(),
        );

        for table_name in context.tables() {
            let context = context.clone();
            let timestamp_parser = timestamp_parser.clone();
            let owned_table_name = table_name.clone();

            builder = builder.with_inventory(table_name, async move {
                let metadata_loader = context.metadata_loader();
                let Some(metadata) = metadata_loader
                    .load_table_metadata(&owned_table_name)
                    .await?
                else {
                    bail!(
                        ErrorKind::MissingTableMetadata,
                        "Table not found on source",
                        format!("Table {owned_table_name} does not exist")
                    );
                };

                PgInventorySource::new(context.source_pool().clone(), metadata, timestamp_parser)
            });
        }

        Ok(builder.build(self.sink.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TasksRunner;
    use crate::sink::memory::MemorySink;
    use crate::test_utils::config::test_job_config;

    #[test]
    fn unknown_job_is_a_config_error() {
        let job = PgPipelineJob::new([test_job_config("j1", 1)], MemorySink::new());

        assert_eq!(job.job_ids().collect::<Vec<_>>(), vec!["j1"]);
        assert!(job.job_config("j1").is_ok());
        let err = job.job_config("j2").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[tokio::test]
    async fn runner_is_built_without_touching_the_source() {
        let job = PgPipelineJob::new([test_job_config("j1", 1)], MemorySink::new());
        let context = Arc::new(
            JobItemContext::new(job.job_config("j1").unwrap(), 0, "slot".into(), None).unwrap(),
        );

        let runner = job.build_runner(context.clone()).unwrap();

        assert!(!runner.is_stopping());
        assert!(Arc::ptr_eq(runner.job_item_context(), &context));
    }
}
