//! Targets that apply the records fetched from a pipeline channel.

mod base;
pub mod memory;

pub use base::Sink;
