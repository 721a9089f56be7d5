//! Conversions from source text representations to [`crate::types::Value`].

pub mod bool;
pub mod hex;
pub mod text;
pub mod timestamp;
