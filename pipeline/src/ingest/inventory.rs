use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use pg_escape::quote_identifier;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::bail;
use crate::channel::PipelineChannel;
use crate::concurrency::stop::StopRx;
use crate::conversions::text::parse_text_value;
use crate::conversions::timestamp::TimestampParser;
use crate::error::{ErrorKind, PipelineResult};
use crate::types::{
    Column, ColumnMetadata, DataRecord, OperationType, Position, Record, TableMetadata, TableName,
    Value,
};

/// Reads the existing rows of one table in primary key order.
pub trait InventorySource: Send {
    fn table_name(&self) -> &TableName;

    /// Returns up to `limit` rows following the previously returned page. An empty page
    /// means the table is exhausted.
    fn next_page(
        &mut self,
        limit: usize,
    ) -> impl Future<Output = PipelineResult<Vec<Vec<Column>>>> + Send;
}

/// Copies the existing rows of a table into a pipeline channel as inserts.
pub struct InventoryDumper<S, C> {
    source: S,
    channel: Arc<C>,
    batch_size: usize,
    /// Shared counter of rows pushed by every inventory task of a shard item.
    inventory_records: Arc<AtomicU64>,
    stop_rx: StopRx,
    next_sequence: u64,
    finished: bool,
}

impl<S, C> InventoryDumper<S, C>
where
    S: InventorySource,
    C: PipelineChannel + Send + Sync,
{
    pub fn new(
        source: S,
        channel: Arc<C>,
        batch_size: usize,
        inventory_records: Arc<AtomicU64>,
        stop_rx: StopRx,
    ) -> Self {
        Self {
            source,
            channel,
            batch_size,
            inventory_records,
            stop_rx,
            next_sequence: 1,
            finished: false,
        }
    }

    /// Whether every row was pushed and the `Finished` record followed them.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Copies the table page by page. A `Finished` record follows the last page unless
    /// stop was requested first.
    pub async fn run(&mut self) -> PipelineResult<()> {
        let table_name = self.source.table_name().clone();
        info!(table = %table_name, "inventory dump started");

        while !self.stop_rx.is_stopped() {
            let rows = self.source.next_page(self.batch_size).await?;
            if rows.is_empty() {
                self.channel
                    .push(vec![Record::Finished {
                        position: Position::Inventory(self.next_sequence),
                    }])
                    .await?;
                self.finished = true;

                info!(table = %table_name, rows = self.next_sequence - 1, "inventory dump done");

                return Ok(());
            }

            let count = rows.len() as u64;
            let records = rows
                .into_iter()
                .map(|row| {
                    let mut record = DataRecord::new(
                        OperationType::Insert,
                        table_name.clone(),
                        Position::Inventory(self.next_sequence),
                    );
                    record.after_row = row;
                    self.next_sequence += 1;
                    Record::Data(record)
                })
                .collect();

            self.channel.push(records).await?;
            self.inventory_records.fetch_add(count, Ordering::Relaxed);

            debug!(table = %table_name, count, "inventory page pushed");
        }

        info!(table = %table_name, "inventory dump stopped");

        Ok(())
    }
}

/// [`InventorySource`] paging through a Postgres table by its primary key.
///
/// Values are fetched in text form and parsed with the same rules as replicated values.
pub struct PgInventorySource {
    pool: PgPool,
    metadata: Arc<TableMetadata>,
    timestamp_parser: Arc<dyn TimestampParser>,
    key_column: ColumnMetadata,
    /// Text form of the last key returned.
    last_key: Option<String>,
}

impl PgInventorySource {
    /// Fails with [`ErrorKind::SourceSchemaError`] unless the table has a single column
    /// primary key.
    pub fn new(
        pool: PgPool,
        metadata: Arc<TableMetadata>,
        timestamp_parser: Arc<dyn TimestampParser>,
    ) -> PipelineResult<Self> {
        let keys: Vec<_> = metadata.primary_key_columns().collect();
        let [key_column] = keys.as_slice() else {
            bail!(
                ErrorKind::SourceSchemaError,
                "Inventory dump requires a single column primary key",
                format!(
                    "Table {} has {} primary key columns",
                    metadata.table_name,
                    keys.len()
                )
            );
        };
        let key_column = (*key_column).clone();

        Ok(Self {
            pool,
            metadata,
            timestamp_parser,
            key_column,
            last_key: None,
        })
    }

    fn page_query(&self, limit: usize) -> String {
        let columns = self
            .metadata
            .columns
            .iter()
            .map(|column| format!("{}::text", quote_identifier(&column.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let table = format!(
            "{}.{}",
            quote_identifier(&self.metadata.table_name.schema),
            quote_identifier(&self.metadata.table_name.name)
        );
        let key = quote_identifier(&self.key_column.name);

        let filter = match self.last_key {
            Some(_) => format!(
                "where {key} > cast($1 as {})",
                self.key_column.type_name
            ),
            None => String::new(),
        };

        format!("select {columns} from {table} {filter} order by {key} limit {limit}")
    }

    fn build_row(&self, row: &PgRow) -> PipelineResult<Vec<Column>> {
        let mut columns = Vec::with_capacity(self.metadata.columns.len());

        for (index, metadata) in self.metadata.columns.iter().enumerate() {
            let text: Option<String> = row.try_get(index)?;
            let value = match text {
                Some(text) => parse_text_value(
                    &metadata.type_name,
                    &text,
                    self.timestamp_parser.as_ref(),
                )?,
                None => Value::Null,
            };

            let mut column = Column::new(metadata.name.clone(), value).updated(None);
            column.is_primary_key = metadata.is_primary_key;
            column.is_unique_key = metadata.is_unique_key;
            columns.push(column);
        }

        Ok(columns)
    }
}

impl InventorySource for PgInventorySource {
    fn table_name(&self) -> &TableName {
        &self.metadata.table_name
    }

    async fn next_page(&mut self, limit: usize) -> PipelineResult<Vec<Vec<Column>>> {
        let query = self.page_query(limit);
        let rows = match &self.last_key {
            Some(last_key) => {
                sqlx::query(&query)
                    .bind(last_key)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => sqlx::query(&query).fetch_all(&self.pool).await?,
        };

        let key_index = self
            .metadata
            .columns
            .iter()
            .position(|column| column.name == self.key_column.name)
            .unwrap_or_default();
        if let Some(last) = rows.last() {
            self.last_key = last.try_get::<Option<String>, _>(key_index)?;
        }

        rows.iter().map(|row| self.build_row(row)).collect()
    }
}
