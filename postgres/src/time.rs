use chrono::{DateTime, NaiveDate, Utc};

/// Microseconds between the Unix epoch and the Postgres epoch (2000-01-01 00:00:00 UTC).
const POSTGRES_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Returns the Postgres epoch as a date.
pub fn postgres_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

/// Converts `time` to microseconds since the Postgres epoch, the clock used by the
/// replication protocol's status messages.
pub fn to_postgres_micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros() - POSTGRES_EPOCH_OFFSET_MICROS
}

/// Current time in replication protocol microseconds.
pub fn postgres_now_micros() -> i64 {
    to_postgres_micros(Utc::now())
}
