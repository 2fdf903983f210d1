pub mod cache;
pub mod config;
pub mod engine;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod registry;
pub mod slots;
pub mod wal;
