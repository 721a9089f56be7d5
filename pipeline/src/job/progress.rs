use serde::{Deserialize, Serialize};

use crate::types::Position;

/// Lifecycle status of a job shard item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Preparing,
    PrepareFailure,
    ExecuteInventoryTask,
    ExecuteIncrementalTask,
    ExecuteFailure,
    Finished,
}

impl JobStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::PrepareFailure | JobStatus::ExecuteFailure)
    }
}

/// Persisted progress of a job shard item.
///
/// Stored as JSON by the progress store. Unknown fields are ignored and missing fields
/// take their defaults, so older records keep loading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobItemProgress {
    pub status: JobStatus,
    /// Position up to which every replicated change has been applied.
    pub position: Option<Position>,
    /// Whether the inventory tasks of the item ran to completion.
    pub inventory_finished: bool,
    pub processed_records_count: u64,
    pub inventory_records_count: u64,
}
