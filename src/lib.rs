//! alertflow: per-alert filtering, ingestion and rejection logging for
//! astronomical transient alert streams.

pub mod alert;
pub mod config;
pub mod consumer;
pub mod directive;
pub mod error;
pub mod filter;
pub mod ingest;
pub mod metrics;
pub mod register;
pub mod retry;
pub mod store;

pub use consumer::{AlertConsumer, StopHandle};
