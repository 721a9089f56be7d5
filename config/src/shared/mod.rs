mod base;
mod batch;
mod channel;
mod connection;
mod job;
mod progress_store;

pub use base::*;
pub use batch::*;
pub use channel::*;
pub use connection::*;
pub use job::*;
pub use progress_store::*;
