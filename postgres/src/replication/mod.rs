mod db;
mod progress;
mod slots;

pub use db::*;
pub use progress::*;
pub use slots::*;
