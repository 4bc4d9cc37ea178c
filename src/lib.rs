//! Bulk email campaigns: recipient ingestion, scheduling, dispatch with
//! per-recipient failure isolation, delivery logging and reporting.

pub mod campaign;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod email;
pub mod error;
pub mod ingest;
pub mod model;
pub mod outbox;
pub mod recipients;
pub mod recorder;
pub mod report;
pub mod scheduler;
pub mod summary;
pub mod template;
pub mod transport;

pub use error::{Error, Result};
