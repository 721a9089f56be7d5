use std::sync::Arc;

use crate::error::PipelineResult;
use crate::types::{TableMetadata, TableName};

/// Trait for looking up the columns and key membership of source tables.
///
/// Implementations are shared by the tasks of a shard item and must be safe to call
/// concurrently. Returns `None` when the table does not exist on the source.
pub trait MetadataLoader {
    fn load_table_metadata(
        &self,
        table_name: &TableName,
    ) -> impl Future<Output = PipelineResult<Option<Arc<TableMetadata>>>> + Send;
}
