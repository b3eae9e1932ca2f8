use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    /// The backing table could not be read or written
    #[error("Queue storage error: {0}")]
    Storage(String),

    #[error("Malformed dispatch job: {0}")]
    MalformedJob(#[from] serde_json::Error),

    /// Acked or extended after the receipt expired or the job was already acked
    #[error("No in-flight job for receipt {0}")]
    UnknownReceipt(String),

    #[error("Queue consumer stopped")]
    Stopped,
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Storage(e.to_string())
    }
}
