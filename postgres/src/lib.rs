pub mod migrations;
pub mod replication;
pub mod schema;
pub mod time;
pub mod types;
