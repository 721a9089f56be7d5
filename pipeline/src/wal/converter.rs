use std::collections::HashSet;
use std::sync::Arc;

use crate::bail;
use crate::error::{ErrorKind, PipelineResult};
use crate::metadata::MetadataLoader;
use crate::types::{Column, DataRecord, OperationType, Record, TableMetadata, TableName};
use crate::wal::{DecodedColumn, RowEvent, WalEvent};

/// Turns decoded [`WalEvent`]s into [`Record`]s, attaching key information from table
/// metadata.
#[derive(Debug)]
pub struct WalEventConverter<M> {
    tables: HashSet<TableName>,
    metadata_loader: Arc<M>,
}

impl<M> WalEventConverter<M>
where
    M: MetadataLoader,
{
    /// Creates a converter for changes of `tables`. Changes of any other table convert to
    /// placeholders.
    pub fn new(tables: impl IntoIterator<Item = TableName>, metadata_loader: Arc<M>) -> Self {
        Self {
            tables: tables.into_iter().collect(),
            metadata_loader,
        }
    }

    pub fn handles_table(&self, table_name: &TableName) -> bool {
        self.tables.contains(table_name)
    }

    /// Converts one event. Transaction markers become placeholders.
    pub async fn convert(&self, event: WalEvent) -> PipelineResult<Record> {
        match event {
            WalEvent::Row(row) if self.handles_table(&row.table_name) => {
                Ok(Record::Data(self.convert_row(row).await?))
            }
            other => Ok(Record::Placeholder {
                position: other.position(),
            }),
        }
    }

    async fn convert_row(&self, row: RowEvent) -> PipelineResult<DataRecord> {
        let Some(metadata) = self
            .metadata_loader
            .load_table_metadata(&row.table_name)
            .await?
        else {
            bail!(
                ErrorKind::MissingTableMetadata,
                "Table metadata not found for replicated table",
                format!("No metadata for table {}", row.table_name)
            );
        };

        let mut record = DataRecord::new(row.operation, row.table_name, row.position);
        record.sharding_columns_count = metadata.primary_key_columns().count();

        match row.operation {
            OperationType::Insert => {
                record.after_row = row
                    .columns
                    .into_iter()
                    .map(|column| build_column(&metadata, column).updated(None))
                    .collect();
            }
            OperationType::Update => {
                let old_keys = row.old_keys;
                record.after_row = row
                    .columns
                    .into_iter()
                    .map(|column| {
                        let old_value = old_keys
                            .iter()
                            .find(|key| key.name == column.name)
                            .map(|key| key.value.clone());
                        let column = build_column(&metadata, column);
                        // Key columns always carry the value identifying the old row.
                        let old_value = column
                            .is_primary_key
                            .then(|| old_value.unwrap_or_else(|| column.value.clone()));

                        column.updated(old_value)
                    })
                    .collect();
            }
            OperationType::Delete => {
                record.before_row = Some(
                    row.old_keys
                        .into_iter()
                        .map(|column| build_column(&metadata, column))
                        .collect(),
                );
            }
        }

        Ok(record)
    }
}

fn build_column(metadata: &TableMetadata, decoded: DecodedColumn) -> Column {
    let mut column = Column::new(decoded.name, decoded.value);
    if let Some(column_metadata) = metadata.column(&column.name) {
        column.is_primary_key = column_metadata.is_primary_key;
        column.is_unique_key = column_metadata.is_unique_key;
    }

    column
}
