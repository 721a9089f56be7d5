use sqlx::{PgPool, prelude::FromRow};

/// A row of `pipeline.job_item_progress`.
#[derive(Debug, FromRow)]
pub struct JobItemProgressRow {
    pub job_id: String,
    pub shard_item: i32,
    pub progress: serde_json::Value,
}

/// Loads the persisted progress of a job shard item.
pub async fn get_job_item_progress(
    pool: &PgPool,
    job_id: &str,
    shard_item: i32,
) -> sqlx::Result<Option<JobItemProgressRow>> {
    sqlx::query_as::<_, JobItemProgressRow>(
        r#"
        select job_id, shard_item, progress
        from pipeline.job_item_progress
        where job_id = $1 and shard_item = $2
        "#,
    )
    .bind(job_id)
    .bind(shard_item)
    .fetch_optional(pool)
    .await
}

/// Inserts or replaces the progress of a job shard item.
pub async fn upsert_job_item_progress(
    pool: &PgPool,
    job_id: &str,
    shard_item: i32,
    progress: serde_json::Value,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        insert into pipeline.job_item_progress (job_id, shard_item, progress)
        values ($1, $2, $3)
        on conflict (job_id, shard_item)
        do update set progress = excluded.progress, updated_at = now()
        "#,
    )
    .bind(job_id)
    .bind(shard_item)
    .bind(progress)
    .execute(pool)
    .await?;

    Ok(())
}

/// Records the latest error of a job shard item, replacing the previous one.
pub async fn upsert_job_item_error(
    pool: &PgPool,
    job_id: &str,
    shard_item: i32,
    error_message: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        insert into pipeline.job_item_errors (job_id, shard_item, error_message)
        values ($1, $2, $3)
        on conflict (job_id, shard_item)
        do update set error_message = excluded.error_message, recorded_at = now()
        "#,
    )
    .bind(job_id)
    .bind(shard_item)
    .bind(error_message)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_job_item_error(
    pool: &PgPool,
    job_id: &str,
    shard_item: i32,
) -> sqlx::Result<Option<String>> {
    sqlx::query_scalar(
        r#"
        select error_message
        from pipeline.job_item_errors
        where job_id = $1 and shard_item = $2
        "#,
    )
    .bind(job_id)
    .bind(shard_item)
    .fetch_optional(pool)
    .await
}

pub async fn delete_job_item_error(pool: &PgPool, job_id: &str, shard_item: i32) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        delete from pipeline.job_item_errors
        where job_id = $1 and shard_item = $2
        "#,
    )
    .bind(job_id)
    .bind(shard_item)
    .execute(pool)
    .await?;

    Ok(())
}
