pub mod binlog;
pub mod channel;
pub mod concurrency;
pub mod conversions;
pub mod error;
pub mod failpoints;
pub mod ingest;
pub mod job;
mod macros;
pub mod metadata;
pub mod sink;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod wal;
