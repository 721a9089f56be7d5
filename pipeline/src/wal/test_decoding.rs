use std::borrow::Cow;
use std::sync::Arc;

use tracing::debug;

use crate::bail;
use crate::conversions::text::parse_text_value;
use crate::conversions::timestamp::TimestampParser;
use crate::error::{ErrorKind, PipelineResult};
use crate::types::{OperationType, Position, TableName, Value};
use crate::wal::decoder::parse_marker_number;
use crate::wal::{BeginEvent, CommitEvent, DecodedColumn, DecodingPlugin, RowEvent, WalEvent};

const UNCHANGED_TOAST_DATUM: &str = "unchanged-toast-datum";

/// Decoder for the text output of the `test_decoding` plugin.
///
/// Row messages look like
/// `table public.t: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:2 name[text]:'a'`.
#[derive(Clone)]
pub struct TestDecodingPlugin {
    timestamp_parser: Arc<dyn TimestampParser>,
}

impl TestDecodingPlugin {
    pub fn new(timestamp_parser: Arc<dyn TimestampParser>) -> Self {
        Self { timestamp_parser }
    }

    fn decode_row(
        &self,
        table_name: &str,
        operation: &str,
        body: &str,
        position: Position,
    ) -> PipelineResult<WalEvent> {
        let operation = match operation {
            "INSERT" => OperationType::Insert,
            "UPDATE" => OperationType::Update,
            "DELETE" => OperationType::Delete,
            _ => bail!(
                ErrorKind::UnknownOperation,
                "Unknown operation in replication message",
                format!("operation '{operation}' on table {table_name}")
            ),
        };

        let mut reader = ColumnReader::new(body);
        let mut columns = Vec::new();
        let mut old_keys = Vec::new();

        if reader.eat("(no-tuple-data)") {
            reader.skip_spaces();
        }
        if reader.eat("old-key:") {
            old_keys = self.read_columns(&mut reader, Some("new-tuple:"))?;
            reader.eat("new-tuple:");
        }
        let tuple = self.read_columns(&mut reader, None)?;

        match operation {
            // The delete tuple only carries the replica identity.
            OperationType::Delete => old_keys = tuple,
            OperationType::Insert | OperationType::Update => columns = tuple,
        }

        Ok(WalEvent::Row(RowEvent {
            operation,
            table_name: TableName::parse(table_name),
            position,
            columns,
            old_keys,
        }))
    }

    /// Reads columns until the end of input or until `stop_at` starts the remaining input.
    fn read_columns(
        &self,
        reader: &mut ColumnReader<'_>,
        stop_at: Option<&str>,
    ) -> PipelineResult<Vec<DecodedColumn>> {
        let mut columns = Vec::new();

        loop {
            reader.skip_spaces();
            if reader.is_empty() || stop_at.is_some_and(|stop| reader.starts_with(stop)) {
                return Ok(columns);
            }

            let name = reader.read_name()?;
            let type_name = reader.read_type()?;
            let value = match reader.read_value()? {
                RawValue::Null => Value::Null,
                RawValue::Text(text) => {
                    parse_text_value(type_name, &text, self.timestamp_parser.as_ref())?
                }
                RawValue::UnchangedToast => {
                    debug!(column = %name, "skipping unchanged toasted column");
                    continue;
                }
            };

            columns.push(DecodedColumn::new(name, type_name, value));
        }
    }
}

impl DecodingPlugin for TestDecodingPlugin {
    fn decode(&self, data: &[u8], lsn: u64) -> PipelineResult<WalEvent> {
        let position = Position::Wal(lsn);
        let message = std::str::from_utf8(data)?;

        if let Some(rest) = message.strip_prefix("BEGIN ") {
            return Ok(WalEvent::Begin(BeginEvent {
                position,
                xid: parse_marker_number(rest),
                csn: None,
            }));
        }
        if let Some(rest) = message.strip_prefix("COMMIT ") {
            return Ok(WalEvent::Commit(CommitEvent {
                position,
                xid: parse_marker_number(rest),
                csn: None,
            }));
        }

        let header = message
            .strip_prefix("table ")
            .and_then(|rest| rest.split_once(": "))
            .and_then(|(table, rest)| {
                rest.split_once(':')
                    .map(|(operation, body)| (table, operation, body))
            });

        match header {
            Some((table_name, operation, body)) => {
                self.decode_row(table_name, operation, body, position)
            }
            None => {
                debug!(%position, "replication message without row header");
                Ok(WalEvent::Placeholder { position })
            }
        }
    }
}

enum RawValue<'a> {
    Null,
    Text(Cow<'a, str>),
    UnchangedToast,
}

/// Cursor over the column list of a row message.
struct ColumnReader<'a> {
    input: &'a str,
    offset: usize,
}

impl<'a> ColumnReader<'a> {
    fn new(input: &'a str) -> Self {
        let mut reader = Self { input, offset: 0 };
        reader.skip_spaces();
        reader
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.offset..]
    }

    fn is_empty(&self) -> bool {
        self.remaining().is_empty()
    }

    fn starts_with(&self, prefix: &str) -> bool {
        self.remaining().starts_with(prefix)
    }

    fn skip_spaces(&mut self) {
        let remaining = self.remaining();
        self.offset += remaining.len() - remaining.trim_start_matches(' ').len();
    }

    fn eat(&mut self, prefix: &str) -> bool {
        if self.starts_with(prefix) {
            self.offset += prefix.len();
            true
        } else {
            false
        }
    }

    fn read_name(&mut self) -> PipelineResult<String> {
        if self.starts_with("\"") {
            let (name, len) = read_quoted(&self.remaining()[1..], '"')?;
            self.offset += 1 + len;
            return Ok(name.into_owned());
        }

        match self.remaining().find('[') {
            Some(end) => {
                let name = &self.remaining()[..end];
                self.offset += end;
                Ok(name.to_string())
            }
            None => bail!(
                ErrorKind::DecodingError,
                "Column without type in replication message",
                self.remaining()
            ),
        }
    }

    /// Reads `[type]:`. The type ends at the first `]` followed by `:`, so array types
    /// such as `integer[]` are kept intact.
    fn read_type(&mut self) -> PipelineResult<&'a str> {
        let remaining = self.remaining();
        let end = remaining
            .strip_prefix('[')
            .and_then(|rest| rest.find("]:"));

        match end {
            Some(end) => {
                self.offset += end + 3;
                Ok(&remaining[1..end + 1])
            }
            None => bail!(
                ErrorKind::DecodingError,
                "Malformed column type in replication message",
                remaining
            ),
        }
    }

    fn read_value(&mut self) -> PipelineResult<RawValue<'a>> {
        let remaining = self.remaining();

        if let Some(quoted) = remaining.strip_prefix('\'') {
            let (text, len) = read_quoted(quoted, '\'')?;
            self.offset += 1 + len;
            return Ok(RawValue::Text(text));
        }

        let end = remaining.find(' ').unwrap_or(remaining.len());
        self.offset += end;

        Ok(match &remaining[..end] {
            "null" => RawValue::Null,
            UNCHANGED_TOAST_DATUM => RawValue::UnchangedToast,
            text => RawValue::Text(Cow::Borrowed(text)),
        })
    }
}

/// Reads up to the closing `quote`, collapsing doubled quotes. `input` starts after the
/// opening quote. Returns the text and the number of bytes consumed including the closing
/// quote.
fn read_quoted(input: &str, quote: char) -> PipelineResult<(Cow<'_, str>, usize)> {
    let mut unescaped: Option<String> = None;
    let mut chars = input.char_indices().peekable();

    while let Some((index, c)) = chars.next() {
        if c != quote {
            if let Some(text) = unescaped.as_mut() {
                text.push(c);
            }
            continue;
        }

        if chars.peek().is_some_and(|(_, next)| *next == quote) {
            chars.next();
            unescaped
                .get_or_insert_with(|| input[..index].to_string())
                .push(quote);
            continue;
        }

        let text = match unescaped {
            Some(text) => Cow::Owned(text),
            None => Cow::Borrowed(&input[..index]),
        };
        return Ok((text, index + quote.len_utf8()));
    }

    bail!(
        ErrorKind::DecodingError,
        "Unterminated quoted value in replication message",
        input
    )
}
