use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::PipelineResult;
use crate::job::JobItemProgress;
use crate::store::ProgressStore;

type ItemKey = (String, u32);

#[derive(Debug, Default)]
struct Inner {
    progress: HashMap<ItemKey, JobItemProgress>,
    errors: HashMap<ItemKey, String>,
    /// Every error ever recorded, in order. Kept for inspection in tests.
    error_history: Vec<(ItemKey, String)>,
}

/// In-memory [`ProgressStore`]. Everything is lost when the process exits.
#[derive(Debug, Clone, Default)]
pub struct MemoryProgressStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every error recorded for `(job_id, shard_item)`, including cleared ones.
    pub async fn error_history(&self, job_id: &str, shard_item: u32) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .error_history
            .iter()
            .filter(|((id, item), _)| id == job_id && *item == shard_item)
            .map(|(_, error)| error.clone())
            .collect()
    }
}

impl ProgressStore for MemoryProgressStore {
    async fn load_progress(
        &self,
        job_id: &str,
        shard_item: u32,
    ) -> PipelineResult<Option<JobItemProgress>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .progress
            .get(&(job_id.to_string(), shard_item))
            .cloned())
    }

    async fn persist_progress(
        &self,
        job_id: &str,
        shard_item: u32,
        progress: &JobItemProgress,
    ) -> PipelineResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .progress
            .insert((job_id.to_string(), shard_item), progress.clone());

        Ok(())
    }

    async fn record_error(&self, job_id: &str, shard_item: u32, error: &str) -> PipelineResult<()> {
        let mut inner = self.inner.lock().await;
        let key = (job_id.to_string(), shard_item);
        inner.errors.insert(key.clone(), error.to_string());
        inner.error_history.push((key, error.to_string()));

        Ok(())
    }

    async fn clear_error(&self, job_id: &str, shard_item: u32) -> PipelineResult<()> {
        let mut inner = self.inner.lock().await;
        inner.errors.remove(&(job_id.to_string(), shard_item));

        Ok(())
    }

    async fn load_error(&self, job_id: &str, shard_item: u32) -> PipelineResult<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.errors.get(&(job_id.to_string(), shard_item)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::types::Position;

    #[tokio::test]
    async fn error_does_not_touch_progress() {
        let store = MemoryProgressStore::new();
        let progress = JobItemProgress {
            status: JobStatus::ExecuteIncrementalTask,
            position: Some(Position::Wal(100)),
            processed_records_count: 3,
            ..Default::default()
        };

        store.persist_progress("j1", 0, &progress).await.unwrap();
        store.record_error("j1", 0, "stream failed").await.unwrap();

        assert_eq!(store.load_progress("j1", 0).await.unwrap(), Some(progress));
        assert_eq!(
            store.load_error("j1", 0).await.unwrap().as_deref(),
            Some("stream failed")
        );
        assert_eq!(store.load_error("j1", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_error_keeps_history() {
        let store = MemoryProgressStore::new();

        store.record_error("j1", 0, "first").await.unwrap();
        store.record_error("j1", 0, "second").await.unwrap();
        store.clear_error("j1", 0).await.unwrap();

        assert_eq!(store.load_error("j1", 0).await.unwrap(), None);
        assert_eq!(store.error_history("j1", 0).await, vec!["first", "second"]);
        assert!(store.load_progress("j1", 0).await.unwrap().is_none());
    }
}
