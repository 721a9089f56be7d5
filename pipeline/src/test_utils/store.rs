use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::error::PipelineResult;
use crate::job::JobItemProgress;
use crate::store::ProgressStore;
use crate::store::memory::MemoryProgressStore;
use crate::test_utils::notify::TimedNotify;

type ProgressCondition = (
    String,
    u32,
    Arc<Notify>,
    Box<dyn Fn(&JobItemProgress) -> bool + Send + Sync>,
);

/// Held load: fired when the load arrives, awaited before it proceeds.
type LoadGate = (Arc<Notify>, Arc<Notify>);

/// [`MemoryProgressStore`] that wakes tests once persisted progress meets a condition.
#[derive(Clone, Default)]
pub struct NotifyingProgressStore {
    store: MemoryProgressStore,
    conditions: Arc<Mutex<Vec<ProgressCondition>>>,
    load_gate: Arc<Mutex<Option<LoadGate>>>,
}

impl NotifyingProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory(&self) -> &MemoryProgressStore {
        &self.store
    }

    /// Returns a notify fired once the progress of `(job_id, shard_item)` satisfies
    /// `condition`, immediately if the stored progress already does.
    pub async fn notify_on_progress<F>(
        &self,
        job_id: &str,
        shard_item: u32,
        condition: F,
    ) -> TimedNotify
    where
        F: Fn(&JobItemProgress) -> bool + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());
        let mut conditions = self.conditions.lock().await;

        let current = self.store.load_progress(job_id, shard_item).await.ok().flatten();
        if current.as_ref().is_some_and(&condition) {
            notify.notify_one();
        } else {
            conditions.push((
                job_id.to_string(),
                shard_item,
                notify.clone(),
                Box::new(condition),
            ));
        }

        TimedNotify::new(notify, format!("progress condition of {job_id}/{shard_item}"))
    }

    /// Holds the next progress load until the returned notify is fired. The returned
    /// [`TimedNotify`] wakes once that load is being held.
    pub async fn hold_next_load(&self) -> (TimedNotify, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.load_gate.lock().await = Some((entered.clone(), release.clone()));

        (TimedNotify::new(entered, "held progress load"), release)
    }

    async fn check_conditions(&self, job_id: &str, shard_item: u32, progress: &JobItemProgress) {
        self.conditions
            .lock()
            .await
            .retain(|(id, item, notify, condition)| {
                let met = id == job_id && *item == shard_item && condition(progress);
                if met {
                    notify.notify_one();
                }
                !met
            });
    }
}

impl ProgressStore for NotifyingProgressStore {
    async fn load_progress(
        &self,
        job_id: &str,
        shard_item: u32,
    ) -> PipelineResult<Option<JobItemProgress>> {
        let gate = self.load_gate.lock().await.take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }

        self.store.load_progress(job_id, shard_item).await
    }

    async fn persist_progress(
        &self,
        job_id: &str,
        shard_item: u32,
        progress: &JobItemProgress,
    ) -> PipelineResult<()> {
        self.store
            .persist_progress(job_id, shard_item, progress)
            .await?;
        self.check_conditions(job_id, shard_item, progress).await;

        Ok(())
    }

    async fn record_error(&self, job_id: &str, shard_item: u32, error: &str) -> PipelineResult<()> {
        self.store.record_error(job_id, shard_item, error).await
    }

    async fn clear_error(&self, job_id: &str, shard_item: u32) -> PipelineResult<()> {
        self.store.clear_error(job_id, shard_item).await
    }

    async fn load_error(&self, job_id: &str, shard_item: u32) -> PipelineResult<Option<String>> {
        self.store.load_error(job_id, shard_item).await
    }
}
