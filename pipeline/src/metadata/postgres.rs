use std::collections::HashMap;
use std::sync::Arc;

use postgres::schema::fetch_table_columns;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::PipelineResult;
use crate::metadata::MetadataLoader;
use crate::types::{ColumnMetadata, TableMetadata, TableName};

/// Loads table metadata from the source catalog and caches it for the lifetime of the
/// loader.
///
/// Missing tables are not cached, so a table created later is picked up by the next lookup.
#[derive(Debug, Clone)]
pub struct PgMetadataLoader {
    pool: PgPool,
    cache: Arc<Mutex<HashMap<TableName, Arc<TableMetadata>>>>,
}

impl PgMetadataLoader {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl MetadataLoader for PgMetadataLoader {
    async fn load_table_metadata(
        &self,
        table_name: &TableName,
    ) -> PipelineResult<Option<Arc<TableMetadata>>> {
        if let Some(metadata) = self.cache.lock().await.get(table_name) {
            return Ok(Some(metadata.clone()));
        }

        // The query runs without holding the lock; a concurrent load of the same table
        // only overwrites the entry with equal metadata.
        let rows = fetch_table_columns(&self.pool, &table_name.schema, &table_name.name).await?;
        if rows.is_empty() {
            debug!(table = %table_name, "table not found in source catalog");
            return Ok(None);
        }

        let metadata = Arc::new(TableMetadata {
            table_name: table_name.clone(),
            columns: rows
                .into_iter()
                .map(|row| ColumnMetadata {
                    name: row.name,
                    type_name: row.type_name,
                    is_primary_key: row.is_primary_key,
                    is_unique_key: row.is_unique_key,
                })
                .collect(),
        });

        self.cache
            .lock()
            .await
            .insert(table_name.clone(), metadata.clone());

        Ok(Some(metadata))
    }
}
