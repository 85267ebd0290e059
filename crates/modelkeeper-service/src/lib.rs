#[macro_use]
pub mod metrics;

pub mod artifacts;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod locks;
pub mod logging;
pub mod models;
pub mod records;
pub mod retry;
pub mod services;
pub mod store;
pub mod sweeper;
pub mod writer;
