//! Dumpers reading the source database: the incremental dumper follows a replication slot,
//! inventory dumpers copy the rows that existed before.

mod incremental;
mod inventory;
mod postgres;
mod source;

pub use incremental::*;
pub use inventory::*;
pub use self::postgres::*;
pub use source::*;
