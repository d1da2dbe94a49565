pub mod auth;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod session;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
