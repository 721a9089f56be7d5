use std::fmt;

use bytes::Buf;
use chrono::NaiveTime;

use crate::bail;
use crate::error::{ErrorKind, PipelineResult};
use crate::types::Value;

/// Offset added to the integer part so that negative times sort before positive ones.
const TIME2_INT_OFFSET: i64 = 0x80_0000;

/// A decoded TIME2 column. Hours may exceed a day and the value may be negative, so it is
/// only a [`NaiveTime`] when it falls within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Time2 {
    pub negative: bool,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub nanos: u32,
}

impl Time2 {
    pub fn to_naive_time(&self) -> Option<NaiveTime> {
        if self.negative {
            return None;
        }

        NaiveTime::from_hms_nano_opt(self.hours, self.minutes, self.seconds, self.nanos)
    }

    pub fn into_value(self) -> Value {
        match self.to_naive_time() {
            Some(time) => Value::Time(time),
            None => Value::String(self.to_string()),
        }
    }
}

impl fmt::Display for Time2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            f.write_str("-")?;
        }
        write!(f, "{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)?;
        if self.nanos > 0 {
            write!(f, ".{:06}", self.nanos / 1000)?;
        }

        Ok(())
    }
}

/// Number of fractional bytes stored for a fractional seconds precision.
pub fn fractional_width(precision: u8) -> usize {
    match precision {
        1 | 2 => 1,
        3 | 4 => 2,
        5 | 6 => 3,
        _ => 0,
    }
}

/// Reads a TIME2 value: three big-endian bytes holding the sign, hour, minute and second
/// fields, followed by a fractional tail whose width depends on `precision`.
pub fn read_time2<B: Buf>(buf: &mut B, precision: u8) -> PipelineResult<Time2> {
    if precision > 6 {
        bail!(
            ErrorKind::DecodingError,
            "Invalid fractional seconds precision",
            format!("precision {precision} is above 6")
        );
    }

    let width = 3 + fractional_width(precision);
    if buf.remaining() < width {
        bail!(
            ErrorKind::DecodingError,
            "Truncated TIME2 value",
            format!("needed {width} bytes, {} remaining", buf.remaining())
        );
    }

    let mut int_part = buf.get_uint(3) as i64 - TIME2_INT_OFFSET;
    // Negative values store the fraction as a complement borrowed from the integer part.
    let micros = match fractional_width(precision) {
        1 => {
            let mut frac = i64::from(buf.get_u8());
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            frac * 10_000
        }
        2 => {
            let mut frac = i64::from(buf.get_u16());
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x1_0000;
            }
            frac * 100
        }
        3 => {
            let frac = buf.get_uint(3) as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac - 0x100_0000
            } else {
                frac
            }
        }
        _ => 0,
    };

    let packed = (int_part << 24) + micros;
    let negative = packed < 0;
    let packed = packed.unsigned_abs();
    let int_part = packed >> 24;
    let micros = packed % (1 << 24);

    Ok(Time2 {
        negative,
        hours: ((int_part >> 12) % (1 << 10)) as u32,
        minutes: ((int_part >> 6) % (1 << 6)) as u32,
        seconds: (int_part % (1 << 6)) as u32,
        nanos: (micros * 1000) as u32,
    })
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::*;

    fn encoded(int_part: u32, fraction: &[u8], trailing: usize) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_uint(u64::from(0x80_0000 | int_part), 3);
        buf.put_slice(fraction);
        buf.put_bytes(0xee, trailing);
        buf
    }

    const ONE_ONE_ONE: u32 = (1 << 12) | (1 << 6) | 1;

    #[test]
    fn fraction_width_follows_precision() {
        let cases: [(u8, &[u8], u32); 4] = [
            (0, &[], 0),
            (1, &[10], 100_000_000),
            (3, &[0, 2], 200_000),
            (5, &[0, 0, 3], 3_000),
        ];

        for (precision, fraction, nanos) in cases {
            let mut buf = encoded(ONE_ONE_ONE, fraction, 2);

            let time = read_time2(&mut buf, precision).unwrap();

            assert_eq!((time.hours, time.minutes, time.seconds), (1, 1, 1));
            assert_eq!(time.nanos, nanos, "precision {precision}");
            assert!(!time.negative);
            assert_eq!(buf.remaining(), 2, "precision {precision}");
        }
    }

    #[test]
    fn converts_to_time_value() {
        let mut buf = encoded(ONE_ONE_ONE, &[0, 2], 0);

        assert_eq!(
            read_time2(&mut buf, 4).unwrap().into_value(),
            Value::Time(NaiveTime::from_hms_micro_opt(1, 1, 1, 200).unwrap())
        );
    }

    #[test]
    fn negative_time_keeps_sign() {
        // -00:00:01.5 at precision 1: integer part -2 plus a borrowed fraction of 0.5.
        let mut buf = BytesMut::new();
        buf.put_uint((TIME2_INT_OFFSET - 2) as u64, 3);
        buf.put_u8(0xce);

        let time = read_time2(&mut buf, 1).unwrap();

        assert!(time.negative);
        assert_eq!((time.hours, time.minutes, time.seconds), (0, 0, 1));
        assert_eq!(time.nanos, 500_000_000);
        assert_eq!(time.into_value(), Value::from("-00:00:01.500000"));
    }

    #[test]
    fn long_durations_stay_text() {
        let mut buf = encoded(838 << 12 | 59 << 6 | 59, &[], 0);

        assert_eq!(
            read_time2(&mut buf, 0).unwrap().into_value(),
            Value::from("838:59:59")
        );
    }

    #[test]
    fn truncated_input_is_decoding_error() {
        let mut buf = encoded(ONE_ONE_ONE, &[0], 0);

        let err = read_time2(&mut buf, 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodingError);
    }
}
