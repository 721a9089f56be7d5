use std::time::Duration;

use config::shared::{IntoConnectOptions, PgConnectionConfig};
use postgres::migrations::apply_progress_migrations;
use postgres::replication::{
    delete_job_item_error, get_job_item_error, get_job_item_progress, upsert_job_item_error,
    upsert_job_item_progress,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info};

use crate::error::{ErrorKind, PipelineResult};
use crate::job::JobItemProgress;
use crate::pipeline_error;
use crate::store::ProgressStore;

/// Maximum number of connections of the store pool.
const MAX_POOL_CONNECTIONS: u32 = 2;

/// Idle connections are closed after this long, the store is written rarely once a job
/// is streaming.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// [`ProgressStore`] keeping progress and errors in the `pipeline` schema of a Postgres
/// database.
#[derive(Debug, Clone)]
pub struct PostgresProgressStore {
    pool: PgPool,
}

impl PostgresProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the store migrations and returns a store on a lazily connected pool.
    pub async fn connect(config: &PgConnectionConfig) -> PipelineResult<Self> {
        apply_progress_migrations(config).await?;

        let pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(MAX_POOL_CONNECTIONS)
            .idle_timeout(Some(IDLE_TIMEOUT))
            .connect_lazy_with(config.with_db());

        info!("postgres progress store ready");

        Ok(Self::new(pool))
    }
}

fn shard_item_key(shard_item: u32) -> PipelineResult<i32> {
    i32::try_from(shard_item).map_err(|_| {
        pipeline_error!(
            ErrorKind::ConversionError,
            "Shard item does not fit the progress table",
            format!("shard item {shard_item} exceeds i32")
        )
    })
}

impl ProgressStore for PostgresProgressStore {
    async fn load_progress(
        &self,
        job_id: &str,
        shard_item: u32,
    ) -> PipelineResult<Option<JobItemProgress>> {
        let row = get_job_item_progress(&self.pool, job_id, shard_item_key(shard_item)?).await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_value(row.progress)?)),
            None => Ok(None),
        }
    }

    async fn persist_progress(
        &self,
        job_id: &str,
        shard_item: u32,
        progress: &JobItemProgress,
    ) -> PipelineResult<()> {
        let value = serde_json::to_value(progress)?;
        upsert_job_item_progress(&self.pool, job_id, shard_item_key(shard_item)?, value).await?;

        debug!(job_id, shard_item, ?progress, "job item progress persisted");

        Ok(())
    }

    async fn record_error(&self, job_id: &str, shard_item: u32, error: &str) -> PipelineResult<()> {
        upsert_job_item_error(&self.pool, job_id, shard_item_key(shard_item)?, error).await?;

        Ok(())
    }

    async fn clear_error(&self, job_id: &str, shard_item: u32) -> PipelineResult<()> {
        delete_job_item_error(&self.pool, job_id, shard_item_key(shard_item)?).await?;

        Ok(())
    }

    async fn load_error(&self, job_id: &str, shard_item: u32) -> PipelineResult<Option<String>> {
        let error = get_job_item_error(&self.pool, job_id, shard_item_key(shard_item)?).await?;

        Ok(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_item_must_fit_i32() {
        assert_eq!(shard_item_key(7).unwrap(), 7);
        assert_eq!(
            shard_item_key(u32::MAX).unwrap_err().kind(),
            ErrorKind::ConversionError
        );
    }
}
