use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use config::shared::JobConfig;
use postgres::replication::job_slot_name;
use tracing::{error, info, warn};

use crate::error::{ErrorKind, PipelineResult};
use crate::job::{
    JobItemContext, JobRunnerManager, JobStatus, ProgressPersister, RunnerRegistration,
    TasksRunner,
};
use crate::pipeline_error;
use crate::store::ProgressStore;

/// Delay between a position update and the progress write it triggers.
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_millis(500);

/// Builds the pieces the [`JobExecutor`] runs for a job.
pub trait PipelineJob: Send + Sync + 'static {
    type Runner: TasksRunner;

    fn job_config(&self, job_id: &str) -> PipelineResult<Arc<JobConfig>>;

    /// Checks that the source can serve the shard item, before any task starts.
    fn prepare(
        &self,
        context: &Arc<JobItemContext>,
    ) -> impl Future<Output = PipelineResult<()>> + Send;

    /// Builds the runner of a shard item. Must not start any work.
    fn build_runner(&self, context: Arc<JobItemContext>) -> PipelineResult<Self::Runner>;
}

/// Caches the replication slot name of every shard item.
#[derive(Debug, Default)]
pub struct SlotNameRegistry {
    names: Mutex<HashMap<(String, u32), String>>,
}

impl SlotNameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot_name(&self, job_config: &JobConfig, shard_item: u32) -> PipelineResult<String> {
        let key = (job_config.job_id.clone(), shard_item);
        let mut names = self.names.lock().map_err(|_| {
            pipeline_error!(ErrorKind::PipelineInternal, "Slot name registry is poisoned")
        })?;

        if let Some(name) = names.get(&key) {
            return Ok(name.clone());
        }

        let name = job_slot_name(&job_config.source.name, &job_config.job_id, shard_item)?;
        names.insert(key, name.clone());

        Ok(name)
    }
}

/// Runs the shard items of pipeline jobs on behalf of a scheduler.
///
/// [`JobExecutor::execute`] is called once per shard item and returns when the item's
/// tasks exit. Failures are recorded in the progress store so the scheduler can report them.
pub struct JobExecutor<J: PipelineJob, S> {
    job: Arc<J>,
    store: Arc<S>,
    managers: Mutex<HashMap<String, Arc<JobRunnerManager<J::Runner>>>>,
    slot_names: SlotNameRegistry,
    persist_interval: Duration,
}

impl<J, S> JobExecutor<J, S>
where
    J: PipelineJob,
    S: ProgressStore + Send + Sync + 'static,
{
    pub fn new(job: Arc<J>, store: Arc<S>) -> Self {
        Self {
            job,
            store,
            managers: Mutex::new(HashMap::new()),
            slot_names: SlotNameRegistry::new(),
            persist_interval: DEFAULT_PERSIST_INTERVAL,
        }
    }

    pub fn with_persist_interval(mut self, persist_interval: Duration) -> Self {
        self.persist_interval = persist_interval;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the runner manager of `job_id`, creating it on first use.
    pub fn runner_manager(&self, job_id: &str) -> PipelineResult<Arc<JobRunnerManager<J::Runner>>> {
        let mut managers = self.managers.lock().map_err(|_| {
            pipeline_error!(ErrorKind::PipelineInternal, "Runner managers are poisoned")
        })?;

        let manager = managers
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(JobRunnerManager::new(job_id)));

        Ok(manager.clone())
    }

    /// Stops every running shard item of `job_id`. Later executions of the job return
    /// without doing anything.
    pub async fn stop_job(&self, job_id: &str) -> PipelineResult<()> {
        let manager = self.runner_manager(job_id)?;
        manager.stop().await;

        Ok(())
    }

    /// Runs one shard item until its tasks exit.
    ///
    /// Returns `Ok` without doing anything when the job is stopping, including a stop that
    /// arrives while the shard item is being set up, or when the shard item is already
    /// running in this executor. A failure is recorded against the shard item and
    /// returned, unless it happened while the job was stopping.
    pub async fn execute(&self, job_id: &str, shard_item: u32) -> PipelineResult<()> {
        let manager = self.runner_manager(job_id)?;
        if manager.is_stopping() {
            info!(job_id, shard_item, "job is stopping, skipping execution");
            return Ok(());
        }

        let job_config = self.job.job_config(job_id)?;
        let progress = self.store.load_progress(job_id, shard_item).await?;
        let slot_name = self.slot_names.slot_name(&job_config, shard_item)?;
        let context = Arc::new(JobItemContext::new(
            job_config, shard_item, slot_name, progress,
        )?);

        let runner = Arc::new(self.job.build_runner(context.clone())?);
        match manager.add_runner(shard_item, runner.clone()).await {
            RunnerRegistration::Registered => {}
            RunnerRegistration::AlreadyRunning => {
                info!(job_id, shard_item, "shard item is already running, skipping execution");
                return Ok(());
            }
            RunnerRegistration::JobStopping => {
                info!(job_id, shard_item, "job started stopping during setup, skipping execution");
                return Ok(());
            }
        }

        info!(job_id, shard_item, slot_name = context.slot_name(), "executing shard item");

        let result = self.run_registered(&runner, &context).await;

        runner.stop().await;
        manager.remove_runner(shard_item).await;
        context.close_source().await;

        match result {
            Ok(()) => {
                info!(job_id, shard_item, "shard item execution completed");
                Ok(())
            }
            Err(err) if manager.is_stopping() => {
                info!(job_id, shard_item, error = %err, "shard item failed while stopping, ignoring");
                Ok(())
            }
            Err(err) => {
                error!(job_id, shard_item, error = %err, "shard item execution failed");

                if let Err(store_err) = self
                    .store
                    .record_error(job_id, shard_item, &err.to_string())
                    .await
                {
                    error!(job_id, shard_item, error = %store_err, "failed to record shard item error");
                }

                Err(err)
            }
        }
    }

    async fn run_registered(
        &self,
        runner: &Arc<J::Runner>,
        context: &Arc<JobItemContext>,
    ) -> PipelineResult<()> {
        let job_id = context.job_id();
        let shard_item = context.shard_item();

        self.store.clear_error(job_id, shard_item).await?;

        let persister =
            ProgressPersister::new(self.store.clone(), context.clone(), self.persist_interval);

        if let Err(err) = self.job.prepare(context).await {
            context.set_status(JobStatus::PrepareFailure);
            self.persist_final(&persister).await;

            return Err(pipeline_error!(
                ErrorKind::PreparationFailed,
                "Shard item preparation failed",
                source: err
            ));
        }

        if let Err(err) = runner.start().await {
            context.set_status(JobStatus::ExecuteFailure);
            self.persist_final(&persister).await;

            return Err(err);
        }
        persister.persist_now().await?;

        let wait = runner.wait();
        tokio::pin!(wait);
        let result = tokio::select! {
            result = &mut wait => result,
            // Never completes.
            () = persister.run() => Ok(()),
        };

        match &result {
            Ok(()) if !runner.is_stopping() => context.set_status(JobStatus::Finished),
            Ok(()) => {}
            Err(_) => context.set_status(JobStatus::ExecuteFailure),
        }
        self.persist_final(&persister).await;

        result
    }

    async fn persist_final(&self, persister: &ProgressPersister<S>) {
        if let Err(err) = persister.persist_now().await {
            warn!(error = %err, "failed to persist final progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::config::test_job_config;
    use crate::test_utils::job::{TestJob, TestTaskBehavior};
    use crate::test_utils::store::NotifyingProgressStore;

    fn executor(job: TestJob) -> Arc<JobExecutor<TestJob, NotifyingProgressStore>> {
        Arc::new(
            JobExecutor::new(Arc::new(job), Arc::new(NotifyingProgressStore::new()))
                .with_persist_interval(Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn duplicate_execution_is_a_no_op() {
        let job = TestJob::new(test_job_config("j1", 1), TestTaskBehavior::RunUntilStop);
        let executor = executor(job);
        let started = executor
            .store()
            .notify_on_progress("j1", 0, |progress| {
                progress.status == JobStatus::ExecuteIncrementalTask
            })
            .await;

        let first = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute("j1", 0).await }
        });
        started.notified().await;
        let progress_before = executor.store().load_progress("j1", 0).await.unwrap();

        executor.execute("j1", 0).await.unwrap();

        let manager = executor.runner_manager("j1").unwrap();
        assert_eq!(manager.shard_items().await, vec![0]);
        assert_eq!(executor.job.built_runners(), 2);
        assert_eq!(
            executor.store().load_progress("j1", 0).await.unwrap(),
            progress_before
        );

        executor.stop_job("j1").await.unwrap();
        first.await.unwrap().unwrap();
        assert!(manager.shard_items().await.is_empty());
    }

    #[tokio::test]
    async fn failure_while_running_is_recorded_once() {
        let job = TestJob::new(
            test_job_config("j1", 1),
            TestTaskBehavior::Fail(ErrorKind::SinkError),
        );
        let executor = executor(job);

        let err = executor.execute("j1", 0).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SinkError);
        assert_eq!(executor.store().memory().error_history("j1", 0).await.len(), 1);
        let progress = executor.store().load_progress("j1", 0).await.unwrap().unwrap();
        assert_eq!(progress.status, JobStatus::ExecuteFailure);
    }

    #[tokio::test]
    async fn failure_while_stopping_is_swallowed() {
        let job = TestJob::new(
            test_job_config("j1", 1),
            TestTaskBehavior::FailOnStop(ErrorKind::SourceIoError),
        );
        let task_started = job.task_started();
        let executor = executor(job);

        let execution = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute("j1", 0).await }
        });
        task_started.notified().await;

        executor.stop_job("j1").await.unwrap();

        execution.await.unwrap().unwrap();
        assert!(executor.store().memory().error_history("j1", 0).await.is_empty());
    }

    #[tokio::test]
    async fn stopped_job_is_not_executed() {
        let job = TestJob::new(test_job_config("j1", 1), TestTaskBehavior::Complete);
        let executor = executor(job);

        executor.stop_job("j1").await.unwrap();
        executor.execute("j1", 0).await.unwrap();

        assert_eq!(executor.job.built_runners(), 0);
        assert!(executor.store().load_progress("j1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_during_setup_prevents_execution() {
        let job = TestJob::new(test_job_config("j1", 1), TestTaskBehavior::RunUntilStop);
        let executor = executor(job);
        let (load_held, release_load) = executor.store().hold_next_load().await;

        let execution = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute("j1", 0).await }
        });
        load_held.notified().await;
        executor.stop_job("j1").await.unwrap();
        release_load.notify_one();

        tokio::time::timeout(Duration::from_secs(5), execution)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let manager = executor.runner_manager("j1").unwrap();
        assert!(manager.shard_items().await.is_empty());
        assert_eq!(executor.job.built_runners(), 1);
        assert!(executor.store().load_progress("j1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn preparation_failure_is_wrapped() {
        let job = TestJob::new(test_job_config("j1", 1), TestTaskBehavior::Complete)
            .with_prepare_failure(ErrorKind::SourceError);
        let executor = executor(job);

        let err = executor.execute("j1", 0).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PreparationFailed);
        let progress = executor.store().load_progress("j1", 0).await.unwrap().unwrap();
        assert_eq!(progress.status, JobStatus::PrepareFailure);
        assert!(executor.store().load_error("j1", 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn completed_item_is_persisted_as_finished() {
        let job = TestJob::new(test_job_config("j1", 1), TestTaskBehavior::Complete);
        let executor = executor(job);

        executor.execute("j1", 0).await.unwrap();

        let progress = executor.store().load_progress("j1", 0).await.unwrap().unwrap();
        assert_eq!(progress.status, JobStatus::Finished);
    }

    #[test]
    fn slot_names_are_cached_per_shard_item() {
        let registry = SlotNameRegistry::new();
        let config = test_job_config("j1", 2);

        let first = registry.slot_name(&config, 0).unwrap();
        assert_eq!(registry.slot_name(&config, 0).unwrap(), first);
        assert_ne!(registry.slot_name(&config, 1).unwrap(), first);
        assert!(first.starts_with("pipeline_migration_source_"));
    }
}
