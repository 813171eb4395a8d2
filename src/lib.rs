pub mod app;
pub mod clock;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod http;
pub mod identity;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod settlement;
pub mod signature;
pub mod sweeper;
pub mod wal;
