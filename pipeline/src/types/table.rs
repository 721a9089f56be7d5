use std::fmt;

/// Schema qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    /// Schema assumed for unqualified names.
    pub const DEFAULT_SCHEMA: &'static str = "public";

    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parses `schema.table`, or `table` in the default schema.
    ///
    /// Surrounding double quotes of either part are removed.
    pub fn parse(qualified: &str) -> Self {
        match qualified.split_once('.') {
            Some((schema, name)) => Self::new(unquote(schema), unquote(name)),
            None => Self::new(Self::DEFAULT_SCHEMA, unquote(qualified)),
        }
    }
}

fn unquote(part: &str) -> String {
    let part = part.trim();
    match part.strip_prefix('"').and_then(|p| p.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => part.to_string(),
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub type_name: String,
    pub is_primary_key: bool,
    pub is_unique_key: bool,
}

/// Columns of a source table and their key membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    pub table_name: TableName,
    pub columns: Vec<ColumnMetadata>,
}

impl TableMetadata {
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn primary_key_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.columns.iter().filter(|column| column.is_primary_key)
    }
}
