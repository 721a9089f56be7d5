use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span};

use crate::bail;
use crate::channel::{Channel, PipelineChannel};
use crate::concurrency::stop::{StopRx, StopTx};
use crate::error::{ErrorKind, PipelineResult};
use crate::failpoints::{TASKS_RUNNER_BEFORE_START, pipeline_fail_point};
use crate::job::{JobItemContext, JobStatus};
use crate::pipeline_error;

/// A unit of work of a shard item, such as a dumper or an importer.
pub type PipelineTask = Pin<Box<dyn Future<Output = PipelineResult<()>> + Send>>;

/// Runs the tasks of one job shard item.
pub trait TasksRunner: Send + Sync + 'static {
    fn job_item_context(&self) -> &Arc<JobItemContext>;

    /// Spawns the tasks and returns without waiting for them.
    fn start(&self) -> impl Future<Output = PipelineResult<()>> + Send;

    /// Waits until every task has exited. The first failure stops the remaining tasks.
    fn wait(&self) -> impl Future<Output = PipelineResult<()>> + Send;

    /// Requests every task to stop. Returns without waiting for them.
    fn stop(&self) -> impl Future<Output = ()> + Send;

    /// Whether stop was requested, by [`TasksRunner::stop`] or by a failing task.
    fn is_stopping(&self) -> bool;
}

/// [`TasksRunner`] spawning its tasks on the tokio runtime.
pub struct PipelineTasksRunner {
    context: Arc<JobItemContext>,
    channel: Option<Arc<Channel>>,
    stop_tx: StopTx,
    pending: Mutex<Option<Vec<(String, PipelineTask)>>>,
    join_set: Mutex<JoinSet<(String, PipelineResult<()>)>>,
    inventory_tasks: usize,
}

impl PipelineTasksRunner {
    pub fn new(context: Arc<JobItemContext>, stop_tx: StopTx) -> Self {
        Self {
            context,
            channel: None,
            stop_tx,
            pending: Mutex::new(Some(Vec::new())),
            join_set: Mutex::new(JoinSet::new()),
            inventory_tasks: 0,
        }
    }

    /// Closes `channel` on stop, which wakes producers waiting on a full channel.
    pub fn with_channel(mut self, channel: Arc<Channel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Number of added tasks that copy existing rows. Decides the status set on start.
    pub fn with_inventory_tasks(mut self, count: usize) -> Self {
        self.inventory_tasks = count;
        self
    }

    pub fn with_task<F>(mut self, name: impl Into<String>, task: F) -> Self
    where
        F: Future<Output = PipelineResult<()>> + Send + 'static,
    {
        if let Some(tasks) = self.pending.get_mut() {
            tasks.push((name.into(), Box::pin(task)));
        }
        self
    }

    pub fn stop_rx(&self) -> StopRx {
        self.stop_tx.subscribe()
    }

    async fn signal_stop(&self) {
        if self.stop_tx.stop() {
            info!(
                job_id = self.context.job_id(),
                shard_item = self.context.shard_item(),
                "stopping job item tasks"
            );
        }
        if let Some(channel) = &self.channel {
            channel.close().await;
        }
    }
}

impl TasksRunner for PipelineTasksRunner {
    fn job_item_context(&self) -> &Arc<JobItemContext> {
        &self.context
    }

    async fn start(&self) -> PipelineResult<()> {
        let Some(tasks) = self.pending.lock().await.take() else {
            bail!(ErrorKind::InvalidState, "Tasks runner already started");
        };

        pipeline_fail_point(TASKS_RUNNER_BEFORE_START)?;

        if self.inventory_tasks > 0 {
            self.context.set_status(JobStatus::ExecuteInventoryTask);
        } else {
            self.context.set_status(JobStatus::ExecuteIncrementalTask);
        }
        self.context.set_inventory_tasks(self.inventory_tasks);

        let mut join_set = self.join_set.lock().await;
        for (name, task) in tasks {
            let span = info_span!(
                "pipeline_task",
                job_id = self.context.job_id(),
                shard_item = self.context.shard_item(),
                task = %name
            );
            join_set.spawn(
                async move {
                    let result = task.await;
                    (name, result)
                }
                .instrument(span),
            );
        }

        info!(
            job_id = self.context.job_id(),
            shard_item = self.context.shard_item(),
            tasks = join_set.len(),
            "job item tasks started"
        );

        Ok(())
    }

    async fn wait(&self) -> PipelineResult<()> {
        let mut errors = Vec::new();
        let mut join_set = self.join_set.lock().await;

        while let Some(result) = join_set.join_next().await {
            match result {
                Ok((name, Ok(()))) => debug!(task = %name, "task completed"),
                Ok((name, Err(err))) => {
                    if self.is_stopping() && err.kind() == ErrorKind::ChannelClosed {
                        debug!(task = %name, "task interrupted by channel close");
                        continue;
                    }

                    error!(task = %name, error = %err, "task failed");
                    errors.push(err);
                    self.signal_stop().await;
                }
                Err(join_err) => {
                    let err = if join_err.is_cancelled() {
                        pipeline_error!(ErrorKind::TaskCancelled, "Task was cancelled")
                    } else {
                        pipeline_error!(ErrorKind::TaskPanic, "Task panicked", join_err)
                    };
                    error!(error = %err, "task did not complete");
                    errors.push(err);
                    self.signal_stop().await;
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    async fn stop(&self) {
        self.signal_stop().await;
    }

    fn is_stopping(&self) -> bool {
        self.stop_tx.is_stopped()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::concurrency::stop::create_stop_signal;
    use crate::test_utils::config::test_job_config;

    fn context() -> Arc<JobItemContext> {
        Arc::new(
            JobItemContext::new(Arc::new(test_job_config("j1", 1)), 0, "s".into(), None).unwrap(),
        )
    }

    #[tokio::test]
    async fn failure_stops_remaining_tasks() {
        let (stop_tx, _) = create_stop_signal();
        let mut stop_rx = stop_tx.subscribe();
        let runner = PipelineTasksRunner::new(context(), stop_tx)
            .with_task("waiting", async move {
                stop_rx.stopped().await;
                Ok(())
            })
            .with_task("failing", async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                bail!(ErrorKind::SinkError, "sink rejected batch");
            });

        runner.start().await.unwrap();
        let err = runner.wait().await.unwrap_err();

        assert_eq!(err.kinds(), vec![ErrorKind::SinkError]);
        assert!(runner.is_stopping());
    }

    #[tokio::test]
    async fn panic_is_reported() {
        let (stop_tx, _) = create_stop_signal();
        let runner = PipelineTasksRunner::new(context(), stop_tx).with_task("panicking", async {
            panic!("boom");
        });

        runner.start().await.unwrap();
        let err = runner.wait().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TaskPanic);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (stop_tx, _) = create_stop_signal();
        let runner = PipelineTasksRunner::new(context(), stop_tx);

        runner.start().await.unwrap();
        let err = runner.start().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidState);
        runner.wait().await.unwrap();
    }

    #[tokio::test]
    async fn stop_ends_waiting_tasks_cleanly() {
        let (stop_tx, _) = create_stop_signal();
        let mut stop_rx = stop_tx.subscribe();
        let runner = PipelineTasksRunner::new(context(), stop_tx).with_task("waiting", async move {
            stop_rx.stopped().await;
            Ok(())
        });

        runner.start().await.unwrap();
        runner.stop().await;

        runner.wait().await.unwrap();
    }
}
