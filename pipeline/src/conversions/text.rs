use std::str::FromStr;

use bigdecimal::BigDecimal;

use crate::conversions::bool::parse_bool;
use crate::conversions::hex::parse_bytea_hex;
use crate::conversions::timestamp::TimestampParser;
use crate::error::{ErrorKind, PipelineResult};
use crate::pipeline_error;
use crate::types::Value;

/// Normalizes a source type name: lowercase, modifiers such as `(255)` removed and
/// whitespace collapsed.
pub fn normalize_type_name(type_name: &str) -> String {
    let mut normalized = String::with_capacity(type_name.len());
    let mut depth = 0usize;
    for c in type_name.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => normalized.extend(c.to_lowercase()),
            _ => {}
        }
    }

    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Converts the text form of a column value into a typed [`Value`].
///
/// Types without a dedicated representation, including arrays, ranges and intervals, are
/// kept as text. Any parse failure is reported as [`ErrorKind::DecodingError`].
pub fn parse_text_value(
    type_name: &str,
    text: &str,
    timestamp_parser: &dyn TimestampParser,
) -> PipelineResult<Value> {
    let type_name = normalize_type_name(type_name);

    parse_normalized(&type_name, text, timestamp_parser).map_err(|err| {
        pipeline_error!(
            ErrorKind::DecodingError,
            "Column value could not be decoded",
            format!("type '{type_name}': {}", err.description())
        )
        .with_source(err)
    })
}

fn parse_normalized(
    type_name: &str,
    text: &str,
    timestamp_parser: &dyn TimestampParser,
) -> PipelineResult<Value> {
    if type_name.ends_with("[]") {
        return Ok(Value::String(text.to_string()));
    }

    let value = match type_name {
        "tinyint" | "smallint" | "integer" | "int" | "int2" | "int4" | "int8" | "bigint"
        | "binary_integer" | "oid" | "serial" | "bigserial" | "smallserial" => {
            Value::I64(text.parse()?)
        }
        "real" | "float4" | "float8" | "double precision" | "float" | "binary_double" => {
            Value::F64(text.parse()?)
        }
        "numeric" | "decimal" => parse_numeric(text)?,
        "money" => parse_money(text)?,
        "bool" | "boolean" => Value::Bool(parse_bool(text)?),
        "bytea" => Value::Bytes(parse_bytea_hex(text)?),
        "json" | "jsonb" => Value::Json(text.to_string()),
        "date" => Value::Date(timestamp_parser.parse_date(text)?),
        "time" | "time without time zone" => Value::Time(timestamp_parser.parse_time(text)?),
        "timetz" | "time with time zone" => Value::Time(timestamp_parser.parse_time_tz(text)?),
        "timestamp" | "timestamp without time zone" | "smalldatetime" => {
            if is_infinity(text) {
                Value::String(text.to_string())
            } else {
                Value::Timestamp(timestamp_parser.parse_timestamp(text)?)
            }
        }
        "timestamptz" | "timestamp with time zone" => {
            if is_infinity(text) {
                Value::String(text.to_string())
            } else {
                Value::TimestampTz(timestamp_parser.parse_timestamp_tz(text)?)
            }
        }
        _ => Value::String(text.to_string()),
    };

    Ok(value)
}

fn is_infinity(text: &str) -> bool {
    matches!(text, "infinity" | "-infinity")
}

/// `NaN` and infinities have no decimal representation and stay text.
fn parse_numeric(text: &str) -> PipelineResult<Value> {
    if text.eq_ignore_ascii_case("nan") || text.trim_start_matches('-').eq_ignore_ascii_case("infinity") {
        return Ok(Value::String(text.to_string()));
    }

    Ok(Value::Numeric(BigDecimal::from_str(text)?))
}

/// Drops the currency sign and group separators, so `-$1,234.50` becomes `-1234.50`.
fn parse_money(text: &str) -> PipelineResult<Value> {
    let digits: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '-' | '.'))
        .collect();

    Ok(Value::Numeric(BigDecimal::from_str(&digits)?))
}
