use std::borrow::Cow;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::bail;
use crate::conversions::text::parse_text_value;
use crate::conversions::timestamp::TimestampParser;
use crate::error::{ErrorKind, PipelineResult};
use crate::types::{OperationType, Position, TableName, Value};
use crate::wal::decoder::parse_marker_number;
use crate::wal::{BeginEvent, CommitEvent, DecodedColumn, DecodingPlugin, RowEvent, WalEvent};

/// Row message printed by the `mppdb_decoding` plugin.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MppTableData {
    table_name: String,
    op_type: String,
    columns_name: Vec<String>,
    columns_type: Vec<String>,
    columns_val: Vec<String>,
    old_keys_name: Vec<String>,
    old_keys_type: Vec<String>,
    old_keys_val: Vec<String>,
}

/// Decoder for the JSON output of the `mppdb_decoding` plugin.
///
/// Transaction markers are printed as plain text: `BEGIN <xid>` or
/// `BEGIN CSN: <csn> first_lsn: <lsn>`, and `COMMIT <xid> (at <ts>) CSN <csn>` or
/// `commit xid: <xid>`.
#[derive(Clone)]
pub struct MppdbDecodingPlugin {
    timestamp_parser: Arc<dyn TimestampParser>,
}

impl MppdbDecodingPlugin {
    pub fn new(timestamp_parser: Arc<dyn TimestampParser>) -> Self {
        Self { timestamp_parser }
    }

    fn decode_row(&self, data: MppTableData, position: Position) -> PipelineResult<WalEvent> {
        let operation = match data.op_type.as_str() {
            "INSERT" => OperationType::Insert,
            "UPDATE" => OperationType::Update,
            "DELETE" => OperationType::Delete,
            other => bail!(
                ErrorKind::UnknownOperation,
                "Unknown operation in replication message",
                format!("operation '{other}' on table {}", data.table_name)
            ),
        };

        let columns = self.decode_columns(&data.columns_name, &data.columns_type, &data.columns_val)?;
        let old_keys =
            self.decode_columns(&data.old_keys_name, &data.old_keys_type, &data.old_keys_val)?;

        Ok(WalEvent::Row(RowEvent {
            operation,
            table_name: TableName::parse(&data.table_name),
            position,
            columns,
            old_keys,
        }))
    }

    fn decode_columns(
        &self,
        names: &[String],
        types: &[String],
        values: &[String],
    ) -> PipelineResult<Vec<DecodedColumn>> {
        if names.len() != types.len() || names.len() != values.len() {
            bail!(
                ErrorKind::DecodingError,
                "Column names, types and values differ in length",
                format!(
                    "{} names, {} types, {} values",
                    names.len(),
                    types.len(),
                    values.len()
                )
            );
        }

        names
            .iter()
            .zip(types)
            .zip(values)
            .map(|((name, type_name), raw)| {
                let value = match unquote(raw) {
                    None => Value::Null,
                    Some(text) => {
                        parse_text_value(type_name, &text, self.timestamp_parser.as_ref())?
                    }
                };

                Ok(DecodedColumn::new(name.as_str(), type_name.as_str(), value))
            })
            .collect()
    }
}

impl DecodingPlugin for MppdbDecodingPlugin {
    fn decode(&self, data: &[u8], lsn: u64) -> PipelineResult<WalEvent> {
        let position = Position::Wal(lsn);
        let message = std::str::from_utf8(data)?;

        if message.starts_with('{') {
            let table_data: MppTableData = serde_json::from_str(message)?;
            return self.decode_row(table_data, position);
        }

        if let Some(rest) = message.strip_prefix("BEGIN CSN: ") {
            return Ok(WalEvent::Begin(BeginEvent {
                position,
                xid: None,
                csn: parse_marker_number(rest),
            }));
        }
        if let Some(rest) = message.strip_prefix("BEGIN ") {
            return Ok(WalEvent::Begin(BeginEvent {
                position,
                xid: parse_marker_number(rest),
                csn: None,
            }));
        }
        if let Some(rest) = message.strip_prefix("commit xid: ") {
            return Ok(WalEvent::Commit(CommitEvent {
                position,
                xid: parse_marker_number(rest),
                csn: None,
            }));
        }
        if let Some(rest) = message.strip_prefix("COMMIT ") {
            let csn = rest
                .rsplit_once("CSN ")
                .and_then(|(_, csn)| parse_marker_number(csn));
            return Ok(WalEvent::Commit(CommitEvent {
                position,
                xid: parse_marker_number(rest),
                csn,
            }));
        }

        debug!(%position, "replication message is neither a row nor a transaction marker");
        Ok(WalEvent::Placeholder { position })
    }
}

/// Removes the surrounding single quotes and collapses doubled quotes. An unquoted
/// `null` is the SQL null.
fn unquote(raw: &str) -> Option<Cow<'_, str>> {
    match raw.strip_prefix('\'').and_then(|inner| inner.strip_suffix('\'')) {
        Some(inner) if inner.contains("''") => Some(Cow::Owned(inner.replace("''", "'"))),
        Some(inner) => Some(Cow::Borrowed(inner)),
        None if raw == "null" => None,
        None => Some(Cow::Borrowed(raw)),
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bigdecimal::BigDecimal;
    use serde_json::json;

    use super::*;
    use crate::conversions::timestamp::IsoTimestampParser;

    fn plugin() -> MppdbDecodingPlugin {
        MppdbDecodingPlugin::new(Arc::new(IsoTimestampParser))
    }

    fn insert(types: &[&str], values: &[&str]) -> Vec<u8> {
        let names: Vec<String> = (0..types.len()).map(|index| format!("data{index}")).collect();
        json!({
            "table_name": "public.test",
            "op_type": "INSERT",
            "columns_name": names,
            "columns_type": types,
            "columns_val": values,
        })
        .to_string()
        .into_bytes()
    }

    fn decode_row(payload: &[u8]) -> RowEvent {
        match plugin().decode(payload, 0x14EFDB8).unwrap() {
            WalEvent::Row(event) => event,
            other => panic!("expected row event, got {other:?}"),
        }
    }

    #[test]
    fn decodes_character_types() {
        let types = [
            "character varying",
            "text",
            "char",
            "character",
            "nchar",
            "varchar2",
            "nvarchar2",
            "clob",
        ];
        let event = decode_row(&insert(&types, &["'1 2 3'"; 8]));

        assert_eq!(event.table_name, TableName::new("public", "test"));
        assert_eq!(event.position, Position::Wal(0x14EFDB8));
        for column in &event.columns {
            assert_eq!(column.value, Value::from("1 2 3"));
        }
    }

    #[test]
    fn decodes_delete_old_keys() {
        let payload = json!({
            "table_name": "public.test",
            "op_type": "DELETE",
            "old_keys_name": ["a", "b", "c"],
            "old_keys_type": ["tinyint", "integer", "bigint"],
            "old_keys_val": ["46", "2147483645", "9223372036854775806"],
        })
        .to_string();

        let event = decode_row(payload.as_bytes());

        assert_eq!(event.operation, OperationType::Delete);
        assert_eq!(
            event
                .old_keys
                .iter()
                .map(|column| column.value.clone())
                .collect::<Vec<_>>(),
            vec![
                Value::I64(46),
                Value::I64(2_147_483_645),
                Value::I64(9_223_372_036_854_775_806)
            ]
        );
    }

    #[test]
    fn decodes_money_bool_bytea_and_ranges() {
        let event = decode_row(&insert(
            &["money", "boolean", "bytea", "raw", "daterange", "tsquery"],
            &[
                "'$1.08'",
                "true",
                "'\\xff00ab'",
                "'7D'",
                "'[2020-01-02,2021-01-02)'",
                "'''fff'' | ''faa'''",
            ],
        ));

        let values: Vec<Value> = event.columns.into_iter().map(|column| column.value).collect();
        assert_eq!(
            values,
            vec![
                Value::Numeric(BigDecimal::from_str("1.08").unwrap()),
                Value::Bool(true),
                Value::Bytes(vec![0xff, 0x00, 0xab]),
                Value::from("7D"),
                Value::from("[2020-01-02,2021-01-02)"),
                Value::from("'fff' | 'faa'"),
            ]
        );
    }

    #[test]
    fn unquoted_null_is_null() {
        let event = decode_row(&insert(&["text", "text"], &["null", "'null'"]));

        assert_eq!(event.columns[0].value, Value::Null);
        assert_eq!(event.columns[1].value, Value::from("null"));
    }

    #[test]
    fn decodes_transaction_markers() {
        let plugin = plugin();

        assert_eq!(
            plugin.decode(b"BEGIN 1", 1).unwrap(),
            WalEvent::Begin(BeginEvent {
                position: Position::Wal(1),
                xid: Some(1),
                csn: None
            })
        );
        assert_eq!(
            plugin
                .decode(b"BEGIN CSN: 951909 first_lsn: 5/59825858", 1)
                .unwrap(),
            WalEvent::Begin(BeginEvent {
                position: Position::Wal(1),
                xid: None,
                csn: Some(951_909)
            })
        );
        assert_eq!(
            plugin
                .decode(b"COMMIT 1 (at 2022-10-27 04:19:39.476261+00) CSN 3468", 2)
                .unwrap(),
            WalEvent::Commit(CommitEvent {
                position: Position::Wal(2),
                xid: Some(1),
                csn: Some(3468)
            })
        );
        assert_eq!(
            plugin.decode(b"commit xid: 1006076", 3).unwrap(),
            WalEvent::Commit(CommitEvent {
                position: Position::Wal(3),
                xid: Some(1_006_076),
                csn: None
            })
        );
    }

    #[test]
    fn non_json_payload_is_placeholder() {
        assert_eq!(
            plugin().decode(b"unknown", 9).unwrap(),
            WalEvent::Placeholder {
                position: Position::Wal(9)
            }
        );
    }

    #[test]
    fn unknown_operation_is_error() {
        let payload = json!({
            "table_name": "public.test",
            "op_type": "UNKNOWN",
            "columns_name": ["data"],
            "columns_type": ["character varying"],
            "columns_val": ["1 2 3"],
        })
        .to_string();

        let err = plugin().decode(payload.as_bytes(), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownOperation);
    }

    #[test]
    fn unparseable_time_is_decoding_error() {
        let err = plugin()
            .decode(&insert(&["time without time zone"], &["'1 2 3'"]), 1)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DecodingError);
    }
}
