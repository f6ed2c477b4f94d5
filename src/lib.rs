pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod report;
pub mod server;
pub mod sql;
pub mod sweeper;
pub mod wal;
pub mod wire;
