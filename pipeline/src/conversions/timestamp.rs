//! Parsing of the date and time text forms printed by the source in ISO `datestyle`.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};

use crate::bail;
use crate::error::{ErrorKind, PipelineResult};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub const TIME_FORMAT: &str = "%H:%M:%S%.f";

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Accepts `+HH`, `+HHMM` and `+HH:MM` offsets.
pub const TIMESTAMPTZ_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%#z";

/// Turns date and time text into typed values.
///
/// Decoders hold the parser behind an [`std::sync::Arc`], so sources with their own text
/// forms can plug in a different implementation. Every failure must be reported as
/// [`ErrorKind::DecodingError`].
pub trait TimestampParser: Send + Sync {
    fn parse_date(&self, text: &str) -> PipelineResult<NaiveDate>;

    fn parse_time(&self, text: &str) -> PipelineResult<NaiveTime>;

    /// Parses a time with offset and returns the equivalent UTC wall clock time.
    fn parse_time_tz(&self, text: &str) -> PipelineResult<NaiveTime>;

    fn parse_timestamp(&self, text: &str) -> PipelineResult<NaiveDateTime>;

    fn parse_timestamp_tz(&self, text: &str) -> PipelineResult<DateTime<Utc>>;
}

/// Parser for the ISO output of Postgres-family servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsoTimestampParser;

impl TimestampParser for IsoTimestampParser {
    fn parse_date(&self, text: &str) -> PipelineResult<NaiveDate> {
        Ok(NaiveDate::parse_from_str(text, DATE_FORMAT)?)
    }

    fn parse_time(&self, text: &str) -> PipelineResult<NaiveTime> {
        Ok(NaiveTime::parse_from_str(text, TIME_FORMAT)?)
    }

    fn parse_time_tz(&self, text: &str) -> PipelineResult<NaiveTime> {
        let Some(split) = text.rfind(['+', '-']) else {
            bail!(
                ErrorKind::DecodingError,
                "Time with time zone has no offset",
                text
            );
        };

        let time = NaiveTime::parse_from_str(&text[..split], TIME_FORMAT)?;
        let offset = parse_offset(&text[split..])?;

        let (utc, _) = time.overflowing_sub_signed(TimeDelta::seconds(
            offset.local_minus_utc().into(),
        ));

        Ok(utc)
    }

    fn parse_timestamp(&self, text: &str) -> PipelineResult<NaiveDateTime> {
        match NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT) {
            Ok(timestamp) => Ok(timestamp),
            // Some servers print midnight timestamps as a bare date.
            Err(err) => match NaiveDate::parse_from_str(text, DATE_FORMAT) {
                Ok(date) => Ok(date.and_time(NaiveTime::MIN)),
                Err(_) => Err(err.into()),
            },
        }
    }

    fn parse_timestamp_tz(&self, text: &str) -> PipelineResult<DateTime<Utc>> {
        Ok(DateTime::<FixedOffset>::parse_from_str(text, TIMESTAMPTZ_FORMAT)?.with_timezone(&Utc))
    }
}

/// Parses `+HH`, `+HHMM`, `+HH:MM` and `+HH:MM:SS` offsets.
fn parse_offset(text: &str) -> PipelineResult<FixedOffset> {
    let (sign, digits) = match text.split_at(1) {
        ("+", digits) => (1, digits),
        ("-", digits) => (-1, digits),
        _ => bail!(ErrorKind::DecodingError, "Invalid time zone offset", text),
    };

    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if !matches!(digits.len(), 2 | 4 | 6) || !digits.bytes().all(|b| b.is_ascii_digit()) {
        bail!(ErrorKind::DecodingError, "Invalid time zone offset", text);
    }

    let mut seconds = 0i32;
    for (index, unit) in [3600, 60, 1].into_iter().enumerate() {
        if let Some(field) = digits.get(index * 2..index * 2 + 2) {
            seconds += field.parse::<i32>()? * unit;
        }
    }

    match FixedOffset::east_opt(sign * seconds) {
        Some(offset) => Ok(offset),
        None => bail!(ErrorKind::DecodingError, "Invalid time zone offset", text),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};

    use super::*;

    #[test]
    fn parses_timestamps_with_and_without_fraction() {
        let parser = IsoTimestampParser;

        let timestamp = parser.parse_timestamp("2024-03-01 10:20:30.123456").unwrap();
        assert_eq!(timestamp.nanosecond(), 123_456_000);

        let midnight = parser.parse_timestamp("2010-12-12").unwrap();
        assert_eq!(midnight.to_string(), "2010-12-12 00:00:00");
    }

    #[test]
    fn converts_timestamptz_to_utc() {
        let parser = IsoTimestampParser;

        let timestamp = parser
            .parse_timestamp_tz("2024-03-01 10:20:30+05:30")
            .unwrap();
        assert_eq!(timestamp.to_rfc3339(), "2024-03-01T04:50:30+00:00");

        let short = parser.parse_timestamp_tz("2024-03-01 10:20:30.5+00").unwrap();
        assert_eq!(short.day(), 1);
        assert_eq!(short.nanosecond(), 500_000_000);
    }

    #[test]
    fn converts_timetz_to_utc_wall_clock() {
        let parser = IsoTimestampParser;

        assert_eq!(
            parser.parse_time_tz("21:21:21-08").unwrap(),
            NaiveTime::from_hms_opt(5, 21, 21).unwrap()
        );
        assert_eq!(
            parser.parse_time_tz("01:00:00.25+02:00").unwrap(),
            NaiveTime::from_hms_milli_opt(23, 0, 0, 250).unwrap()
        );
    }

    #[test]
    fn parse_failures_are_decoding_errors() {
        let parser = IsoTimestampParser;

        assert_eq!(
            parser.parse_time("1 2 3").unwrap_err().kind(),
            ErrorKind::DecodingError
        );
        assert_eq!(
            parser.parse_time_tz("21:21:21").unwrap_err().kind(),
            ErrorKind::DecodingError
        );
        assert_eq!(
            parser.parse_date("2021-13-40").unwrap_err().kind(),
            ErrorKind::DecodingError
        );
    }
}
