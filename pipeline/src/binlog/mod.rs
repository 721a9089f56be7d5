//! Readers for binary row images, where every column is encoded by its column type.

mod time2;
mod value;

pub use time2::*;
pub use value::*;
