pub mod clock;
pub mod config;
pub mod engine;
pub mod files;
pub mod guest;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sweeper;
pub mod tokens;
pub mod wal;
