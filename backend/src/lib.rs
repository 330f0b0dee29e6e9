pub mod aggregator;
pub mod batcher;
pub mod config;
pub mod db;
pub mod execution;
pub mod ingestion;
pub mod intake;
pub mod metrics;
pub mod scheduler;

pub mod error;
pub mod logger;
pub mod time;
