//! Persistence of job item progress and errors.

mod base;
pub mod memory;
pub mod postgres;

pub use base::ProgressStore;
