use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PipelineResult;
use crate::metadata::MetadataLoader;
use crate::types::{TableMetadata, TableName};

/// Metadata loader over a fixed set of tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetadataLoader {
    tables: Arc<HashMap<TableName, Arc<TableMetadata>>>,
}

impl MemoryMetadataLoader {
    pub fn new(tables: impl IntoIterator<Item = TableMetadata>) -> Self {
        let tables = tables
            .into_iter()
            .map(|metadata| (metadata.table_name.clone(), Arc::new(metadata)))
            .collect();

        Self {
            tables: Arc::new(tables),
        }
    }
}

impl MetadataLoader for MemoryMetadataLoader {
    async fn load_table_metadata(
        &self,
        table_name: &TableName,
    ) -> PipelineResult<Option<Arc<TableMetadata>>> {
        Ok(self.tables.get(table_name).cloned())
    }
}
