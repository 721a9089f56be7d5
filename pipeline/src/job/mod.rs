//! Orchestration of job shard items: the executor called by the scheduler, the runners of
//! every shard item and the progress they persist.

mod context;
mod executor;
mod importer;
mod manager;
mod persist;
mod postgres;
mod progress;
mod runner;
mod tasks;

pub use context::*;
pub use executor::*;
pub use importer::*;
pub use manager::*;
pub use persist::*;
pub use self::postgres::*;
pub use progress::*;
pub use runner::*;
pub use tasks::*;
