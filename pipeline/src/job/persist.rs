use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::PipelineResult;
use crate::failpoints::{PROGRESS_PERSISTER_BEFORE_PERSIST, pipeline_fail_point};
use crate::job::JobItemContext;
use crate::store::ProgressStore;

/// Writes the progress of a shard item to the progress store.
///
/// Position updates only notify the persister, which then waits `interval` before writing,
/// so a burst of acknowledgements results in a single write.
#[derive(Debug)]
pub struct ProgressPersister<S> {
    store: Arc<S>,
    context: Arc<JobItemContext>,
    interval: Duration,
}

impl<S> ProgressPersister<S>
where
    S: ProgressStore,
{
    pub fn new(store: Arc<S>, context: Arc<JobItemContext>, interval: Duration) -> Self {
        Self {
            store,
            context,
            interval,
        }
    }

    pub async fn persist_now(&self) -> PipelineResult<()> {
        pipeline_fail_point(PROGRESS_PERSISTER_BEFORE_PERSIST)?;

        let progress = self.context.progress();
        self.store
            .persist_progress(self.context.job_id(), self.context.shard_item(), &progress)
            .await?;

        debug!(
            job_id = self.context.job_id(),
            shard_item = self.context.shard_item(),
            status = ?progress.status,
            position = ?progress.position,
            "progress persisted"
        );

        Ok(())
    }

    /// Persists after every notification. Never returns; callers race it against the
    /// completion of the shard item.
    pub async fn run(&self) {
        loop {
            self.context.persist_notified().await;
            tokio::time::sleep(self.interval).await;

            // A failed write is retried on the next notification and on the final persist.
            if let Err(err) = self.persist_now().await {
                warn!(
                    job_id = self.context.job_id(),
                    shard_item = self.context.shard_item(),
                    error = %err,
                    "failed to persist progress"
                );
            }
        }
    }
}
