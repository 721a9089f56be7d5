use serde::{Deserialize, Serialize};

/// Backend used to persist job item progress and errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStoreConfig {
    /// Progress lives in process memory and is lost on restart.
    #[default]
    Memory,
    /// Progress is kept in the `pipeline` schema of the source database.
    Postgres,
}
