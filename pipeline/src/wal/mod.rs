//! Decoding of logical replication messages into typed row events.

mod converter;
mod decoder;
mod event;
mod mppdb;
mod test_decoding;

pub use converter::*;
pub use decoder::*;
pub use event::*;
pub use mppdb::*;
pub use test_decoding::*;
