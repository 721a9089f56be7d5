//! Helpers for testing shard items without a source database: scripted sources, a
//! notifying progress store and ready-made job configurations.

pub mod config;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod job;
pub mod notify;
pub mod source;
pub mod store;
