use sg_common::RequestStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    Duplicate(String),

    #[error("Sequence number {0} is already taken")]
    DuplicateSequence(i64),

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("A result can only be stored with a terminal status, got {0}")]
    NonTerminalResult(RequestStatus),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for RecordError {
    fn from(e: sqlx::Error) -> Self {
        RecordError::Database(e.to_string())
    }
}
