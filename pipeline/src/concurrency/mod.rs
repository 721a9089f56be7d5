//! Coordination primitives shared by the tasks of a shard item.

pub mod stop;
