use crate::error::PipelineResult;
use crate::job::JobItemProgress;

/// Stores the progress and the last error of every job shard item.
///
/// Implementations must be safe to share between the tasks of several shard items.
pub trait ProgressStore {
    /// Returns the persisted progress, or `None` before the first persist.
    fn load_progress(
        &self,
        job_id: &str,
        shard_item: u32,
    ) -> impl Future<Output = PipelineResult<Option<JobItemProgress>>> + Send;

    /// Replaces the persisted progress.
    fn persist_progress(
        &self,
        job_id: &str,
        shard_item: u32,
        progress: &JobItemProgress,
    ) -> impl Future<Output = PipelineResult<()>> + Send;

    /// Records `error` as the latest failure, replacing the previous one. Progress is left
    /// untouched.
    fn record_error(
        &self,
        job_id: &str,
        shard_item: u32,
        error: &str,
    ) -> impl Future<Output = PipelineResult<()>> + Send;

    fn clear_error(
        &self,
        job_id: &str,
        shard_item: u32,
    ) -> impl Future<Output = PipelineResult<()>> + Send;

    fn load_error(
        &self,
        job_id: &str,
        shard_item: u32,
    ) -> impl Future<Output = PipelineResult<Option<String>>> + Send;
}
