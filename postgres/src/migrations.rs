use config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::{Executor, postgres::PgPoolOptions};
use tracing::info;

/// Creates the `pipeline` schema on the source database and applies the progress table
/// migrations inside it.
///
/// `search_path` points at `pipeline` so that sqlx keeps its migration bookkeeping table
/// out of the public schema.
pub async fn apply_progress_migrations(
    connection_config: &PgConnectionConfig,
) -> Result<(), sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("create schema if not exists pipeline;").await?;
                conn.execute("set search_path = 'pipeline';").await?;

                Ok(())
            })
        })
        .connect_with(connection_config.with_db())
        .await?;

    info!("applying progress store migrations");

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("progress store migrations applied");

    Ok(())
}
