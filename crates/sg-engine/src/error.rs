use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Counter store error: {0}")]
    Store(#[from] sg_store::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] sg_queue::QueueError),

    #[error("Record store error: {0}")]
    Records(#[from] sg_records::RecordError),

    #[error("Downstream error: {0}")]
    Downstream(String),

    #[error("Downstream returned HTTP {status}: {body}")]
    DownstreamStatus { status: u16, body: String },

    #[error("Downstream call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Downstream call panicked: {0}")]
    Panicked(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    /// Error text for degraded-mode reports; store failures lose the layer prefix
    pub fn store_detail(&self) -> String {
        match self {
            EngineError::Store(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}
