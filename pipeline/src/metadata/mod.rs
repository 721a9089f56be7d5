//! Table metadata lookups used to enrich decoded row events.

mod base;
mod memory;
mod postgres;

pub use base::*;
pub use memory::*;
pub use self::postgres::*;
