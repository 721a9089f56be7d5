use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::info;

use crate::job::TasksRunner;

/// Outcome of [`JobRunnerManager::add_runner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerRegistration {
    Registered,
    /// The shard item already has a runner, which stays in place.
    AlreadyRunning,
    JobStopping,
}

/// Tracks the runners of the shard items of one job.
///
/// At most one runner exists per shard item. Once stopped, the manager stays stopped.
#[derive(Debug)]
pub struct JobRunnerManager<R> {
    job_id: String,
    runners: Mutex<HashMap<u32, Arc<R>>>,
    stopping: AtomicBool,
}

impl<R> JobRunnerManager<R>
where
    R: TasksRunner,
{
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            runners: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Registers `runner` under `shard_item`.
    ///
    /// Registration and [`JobRunnerManager::stop`] serialize on the runner map, so a runner
    /// is either registered before the job starts stopping and gets stopped with the
    /// others, or it is refused.
    pub async fn add_runner(&self, shard_item: u32, runner: Arc<R>) -> RunnerRegistration {
        let mut runners = self.runners.lock().await;
        if self.is_stopping() {
            return RunnerRegistration::JobStopping;
        }

        match runners.entry(shard_item) {
            Entry::Occupied(_) => RunnerRegistration::AlreadyRunning,
            Entry::Vacant(entry) => {
                entry.insert(runner);
                RunnerRegistration::Registered
            }
        }
    }

    pub async fn get_runner(&self, shard_item: u32) -> Option<Arc<R>> {
        self.runners.lock().await.get(&shard_item).cloned()
    }

    pub async fn remove_runner(&self, shard_item: u32) -> Option<Arc<R>> {
        self.runners.lock().await.remove(&shard_item)
    }

    pub async fn shard_items(&self) -> Vec<u32> {
        let mut items: Vec<_> = self.runners.lock().await.keys().copied().collect();
        items.sort_unstable();
        items
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Marks the job as stopping and asks every registered runner to stop.
    pub async fn stop(&self) {
        // Runners are collected first so their stop does not run under the map lock.
        let runners: Vec<_> = {
            let runners = self.runners.lock().await;
            self.stopping.store(true, Ordering::Release);
            runners.values().cloned().collect()
        };

        info!(job_id = %self.job_id, runners = runners.len(), "stopping job");

        for runner in runners {
            runner.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::stop::create_stop_signal;
    use crate::job::{JobItemContext, PipelineTasksRunner};
    use crate::test_utils::config::test_job_config;

    fn runner(shard_item: u32) -> Arc<PipelineTasksRunner> {
        let context = JobItemContext::new(
            Arc::new(test_job_config("j1", 2)),
            shard_item,
            "slot".to_string(),
            None,
        )
        .unwrap();
        let (stop_tx, _) = create_stop_signal();

        Arc::new(PipelineTasksRunner::new(Arc::new(context), stop_tx))
    }

    #[tokio::test]
    async fn one_runner_per_shard_item() {
        let manager = JobRunnerManager::new("j1");
        let first = runner(0);

        assert_eq!(
            manager.add_runner(0, first.clone()).await,
            RunnerRegistration::Registered
        );
        assert_eq!(
            manager.add_runner(0, runner(0)).await,
            RunnerRegistration::AlreadyRunning
        );
        assert_eq!(
            manager.add_runner(1, runner(1)).await,
            RunnerRegistration::Registered
        );

        let registered = manager.get_runner(0).await.unwrap();
        assert!(Arc::ptr_eq(&registered, &first));
        assert_eq!(manager.shard_items().await, vec![0, 1]);

        manager.remove_runner(0).await;
        assert!(manager.get_runner(0).await.is_none());
    }

    #[tokio::test]
    async fn stop_reaches_every_runner() {
        let manager = JobRunnerManager::new("j1");
        let first = runner(0);
        let second = runner(1);
        manager.add_runner(0, first.clone()).await;
        manager.add_runner(1, second.clone()).await;

        manager.stop().await;

        assert!(manager.is_stopping());
        assert!(first.is_stopping());
        assert!(second.is_stopping());
    }

    #[tokio::test]
    async fn stopped_job_refuses_new_runners() {
        let manager = JobRunnerManager::new("j1");
        manager.stop().await;

        let late = runner(0);
        assert_eq!(
            manager.add_runner(0, late.clone()).await,
            RunnerRegistration::JobStopping
        );
        assert!(manager.shard_items().await.is_empty());
        assert!(!late.is_stopping());
    }
}
