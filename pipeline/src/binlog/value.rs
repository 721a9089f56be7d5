use bytes::Buf;

use crate::bail;
use crate::binlog::{fractional_width, read_time2};
use crate::error::{ErrorKind, PipelineResult};
use crate::types::Value;

/// Column types with a fixed binary layout in row images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinlogColumnType {
    Tiny,
    Short,
    Int24,
    Long,
    LongLong,
    /// Time with fractional seconds of the given precision.
    Time2 { precision: u8 },
}

impl BinlogColumnType {
    /// Encoded length of a non-null value.
    pub fn encoded_len(&self) -> usize {
        match self {
            BinlogColumnType::Tiny => 1,
            BinlogColumnType::Short => 2,
            BinlogColumnType::Int24 => 3,
            BinlogColumnType::Long => 4,
            BinlogColumnType::LongLong => 8,
            BinlogColumnType::Time2 { precision } => 3 + fractional_width(*precision),
        }
    }
}

/// Reads one non-null column value. Integers are little-endian and signed.
pub fn read_binlog_value<B: Buf>(
    buf: &mut B,
    column_type: BinlogColumnType,
) -> PipelineResult<Value> {
    let len = column_type.encoded_len();
    if buf.remaining() < len {
        bail!(
            ErrorKind::DecodingError,
            "Truncated binary column value",
            format!("{column_type:?} needs {len} bytes, {} remaining", buf.remaining())
        );
    }

    let value = match column_type {
        BinlogColumnType::Tiny => Value::I64(i64::from(buf.get_i8())),
        BinlogColumnType::Short => Value::I64(i64::from(buf.get_i16_le())),
        BinlogColumnType::Int24 => Value::I64(buf.get_int_le(3)),
        BinlogColumnType::Long => Value::I64(i64::from(buf.get_i32_le())),
        BinlogColumnType::LongLong => Value::I64(buf.get_i64_le()),
        BinlogColumnType::Time2 { precision } => read_time2(buf, precision)?.into_value(),
    };

    Ok(value)
}

/// Reads a row image column by column. Bit `i` of `null_bitmap` set means column `i` is
/// null and has no bytes in `buf`.
pub fn read_binlog_row<B: Buf>(
    buf: &mut B,
    column_types: &[BinlogColumnType],
    null_bitmap: &[u8],
) -> PipelineResult<Vec<Value>> {
    if null_bitmap.len() * 8 < column_types.len() {
        bail!(
            ErrorKind::DecodingError,
            "Null bitmap shorter than the column list",
            format!("{} bytes for {} columns", null_bitmap.len(), column_types.len())
        );
    }

    column_types
        .iter()
        .enumerate()
        .map(|(index, column_type)| {
            if null_bitmap[index / 8] & (1 << (index % 8)) != 0 {
                Ok(Value::Null)
            } else {
                read_binlog_value(buf, *column_type)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::*;

    #[test]
    fn reads_signed_little_endian_integers() {
        let mut buf = BytesMut::new();
        buf.put_i8(-1);
        buf.put_i16_le(-300);
        buf.put_int_le(-8_388_608, 3);
        buf.put_i32_le(i32::MAX);
        buf.put_i64_le(i64::MIN);

        let values: Vec<Value> = [
            BinlogColumnType::Tiny,
            BinlogColumnType::Short,
            BinlogColumnType::Int24,
            BinlogColumnType::Long,
            BinlogColumnType::LongLong,
        ]
        .into_iter()
        .map(|column_type| read_binlog_value(&mut buf, column_type).unwrap())
        .collect();

        assert_eq!(
            values,
            vec![
                Value::I64(-1),
                Value::I64(-300),
                Value::I64(-8_388_608),
                Value::I64(i64::from(i32::MAX)),
                Value::I64(i64::MIN),
            ]
        );
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn row_skips_null_columns() {
        let mut buf = BytesMut::new();
        buf.put_i16_le(7);
        buf.put_i32_le(9);

        let values = read_binlog_row(
            &mut buf,
            &[
                BinlogColumnType::Short,
                BinlogColumnType::LongLong,
                BinlogColumnType::Long,
            ],
            &[0b010],
        )
        .unwrap();

        assert_eq!(values, vec![Value::I64(7), Value::Null, Value::I64(9)]);
    }

    #[test]
    fn truncated_integer_is_decoding_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);

        let err = read_binlog_value(&mut buf, BinlogColumnType::Long).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodingError);
    }
}
