use crate::types::{OperationType, Position, TableName, Value};

/// A column as printed by a decoding plugin, already coerced to a typed value.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedColumn {
    pub name: String,
    pub type_name: String,
    pub value: Value,
}

impl DecodedColumn {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            value,
        }
    }
}

/// Row change decoded from a replication message.
#[derive(Debug, Clone, PartialEq)]
pub struct RowEvent {
    pub operation: OperationType,
    pub table_name: TableName,
    pub position: Position,
    /// New row image for inserts and updates.
    pub columns: Vec<DecodedColumn>,
    /// Key columns identifying the old row. Present for deletes and for updates that
    /// changed the replica identity.
    pub old_keys: Vec<DecodedColumn>,
}

/// Transaction start marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginEvent {
    pub position: Position,
    pub xid: Option<u64>,
    pub csn: Option<u64>,
}

/// Transaction end marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitEvent {
    pub position: Position,
    pub xid: Option<u64>,
    /// Commit sequence number, when the plugin prints one.
    pub csn: Option<u64>,
}

/// Output of a [`super::DecodingPlugin`] for one replication message.
#[derive(Debug, Clone, PartialEq)]
pub enum WalEvent {
    Row(RowEvent),
    Begin(BeginEvent),
    Commit(CommitEvent),
    /// A message without a row change this pipeline understands.
    Placeholder { position: Position },
}

impl WalEvent {
    pub fn position(&self) -> Position {
        match self {
            WalEvent::Row(event) => event.position,
            WalEvent::Begin(event) => event.position,
            WalEvent::Commit(event) => event.position,
            WalEvent::Placeholder { position } => *position,
        }
    }
}
