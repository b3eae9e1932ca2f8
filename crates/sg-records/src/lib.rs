//! Request Record Store
//!
//! Long-term holder of request rows keyed by id. The dispatch core treats
//! status and result writes as best-effort; `get` backs status queries.
//!
//! Both implementations enforce the forward-only lifecycle
//! `pending -> processing -> {completed, failed}` at write time.

use async_trait::async_trait;
use sg_common::{RequestRecord, RequestStatus};

pub mod error;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::RecordError;
pub use memory::InMemoryRecordStore;

pub type Result<T> = std::result::Result<T, RecordError>;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new `pending` record
    async fn create(
        &self,
        id: &str,
        payload: &serde_json::Value,
        sequence_number: i64,
    ) -> Result<RequestRecord>;

    /// Move a record to `status` without touching its result
    async fn update_status(&self, id: &str, status: RequestStatus) -> Result<()>;

    /// Store the outcome of a request; `status` must be terminal
    async fn update_result(
        &self,
        id: &str,
        result: &serde_json::Value,
        status: RequestStatus,
    ) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<RequestRecord>>;

    /// Highest sequence number held, if any record exists
    async fn max_sequence_number(&self) -> Result<Option<i64>>;
}

/// Statuses from which a record may move to `next`
#[cfg_attr(not(feature = "sqlite"), allow(dead_code))]
pub(crate) fn predecessors(next: RequestStatus) -> Vec<RequestStatus> {
    [
        RequestStatus::Pending,
        RequestStatus::Processing,
        RequestStatus::Completed,
        RequestStatus::Failed,
    ]
    .into_iter()
    .filter(|s| s.can_transition_to(next))
    .collect()
}
