use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::types::{Position, TableName, Value};

/// Kind of row change carried by a [`DataRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

/// One column of a captured row.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub value: Value,
    /// Value before the change. Set on primary key columns of updates.
    pub old_value: Option<Value>,
    pub is_primary_key: bool,
    pub is_unique_key: bool,
    pub is_updated: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            old_value: None,
            is_primary_key: false,
            is_unique_key: false,
            is_updated: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    pub fn unique_key(mut self) -> Self {
        self.is_unique_key = true;
        self
    }

    pub fn updated(mut self, old_value: Option<Value>) -> Self {
        self.is_updated = true;
        self.old_value = old_value;
        self
    }
}

/// A captured row change.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub operation: OperationType,
    pub table_name: TableName,
    pub position: Position,
    /// Key columns of the row before a delete.
    pub before_row: Option<Vec<Column>>,
    pub after_row: Vec<Column>,
    /// Number of leading primary key columns forming the partition key. Zero means all of
    /// them.
    pub sharding_columns_count: usize,
    /// Commit sequence number of the transaction, when the source provides one.
    pub csn: Option<u64>,
}

impl DataRecord {
    pub fn new(operation: OperationType, table_name: TableName, position: Position) -> Self {
        Self {
            operation,
            table_name,
            position,
            before_row: None,
            after_row: Vec::new(),
            sharding_columns_count: 0,
            csn: None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.after_row.iter().find(|column| column.name == name)
    }

    /// Row image identifying the changed row: the old keys for deletes, the new row
    /// otherwise.
    fn identity_row(&self) -> &[Column] {
        match (&self.operation, &self.before_row) {
            (OperationType::Delete, Some(before_row)) => before_row,
            _ => &self.after_row,
        }
    }

    /// Hash of the table name and the shard key values.
    ///
    /// Rows of tables without a primary key all share the table hash, which keeps every
    /// change of such a table in one partition.
    ///
    /// The value is the same for every channel and thread of the process, but the hash
    /// algorithm of [`DefaultHasher`] may change between Rust releases. It must only pick a
    /// partition in memory and never be persisted or compared across processes.
    pub fn partition_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.table_name.hash(&mut hasher);

        let keys = self
            .identity_row()
            .iter()
            .filter(|column| column.is_primary_key);
        let keys: Box<dyn Iterator<Item = &Column>> = match self.sharding_columns_count {
            0 => Box::new(keys),
            count => Box::new(keys.take(count)),
        };
        for column in keys {
            column.value.hash_into(&mut hasher);
        }

        hasher.finish()
    }
}

/// Unit of transport between dumpers and sinks.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Data(DataRecord),
    /// Advances the position without carrying a change.
    Placeholder { position: Position },
    /// Marks the end of a stream.
    Finished { position: Position },
}

impl Record {
    pub fn position(&self) -> Position {
        match self {
            Record::Data(record) => record.position,
            Record::Placeholder { position } | Record::Finished { position } => *position,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Record::Finished { .. })
    }
}
