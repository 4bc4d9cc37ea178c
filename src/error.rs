//! Library error type.
//!
//! Only operation-fatal problems live here. Per-row ingestion rejections and
//! per-recipient send failures are plain values accumulated into results
//! (see [`crate::ingest::RowRejection`] and [`crate::dispatch::SendFailure`]).
//! A send whose outcome cannot be logged is the exception: it stops the
//! campaign from completing ([`Error::Unrecorded`]).
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid campaign state: {0}")]
    StateConflict(String),
    #[error("file must contain columns: {0}")]
    Schema(String),
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("{0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(
        "campaign {campaign_id} left in_progress: {} delivery outcomes not recorded",
        .emails.len()
    )]
    Unrecorded {
        campaign_id: i64,
        emails: Vec<String>,
    },
    #[error("mail transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn campaign_not_found(id: i64) -> Self {
        Error::NotFound {
            entity: "campaign",
            id: id.to_string(),
        }
    }

    pub fn recipient_not_found(key: impl ToString) -> Self {
        Error::NotFound {
            entity: "recipient",
            id: key.to_string(),
        }
    }
}
