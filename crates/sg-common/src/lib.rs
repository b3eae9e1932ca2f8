use serde::{Deserialize, Serialize, Serializer};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use utoipa::ToSchema;

pub mod logging;

// ============================================================================
// Request Lifecycle
// ============================================================================

/// Lifecycle status of an admitted request.
///
/// Transitions are monotone: `pending -> processing -> {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    /// Completed and failed records never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Processing => 1,
            RequestStatus::Completed | RequestStatus::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the forward-only lifecycle.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown request status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for RequestStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "processing" => Ok(RequestStatus::Processing),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A request row as held by the persistent record store.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RequestRecord {
    pub id: String,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    pub sequence_number: i64,
    pub status: RequestStatus,
    #[schema(value_type = Option<Object>)]
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RequestRecord {
    pub fn new(id: String, payload: serde_json::Value, sequence_number: i64) -> Self {
        let now = Utc::now();
        Self {
            id,
            payload,
            sequence_number,
            status: RequestStatus::Pending,
            result: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

// ============================================================================
// Queue Types
// ============================================================================

/// Unit of work handed from admission to the dispatch workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub request_id: String,
    pub payload: serde_json::Value,
    pub sequence_number: i64,
}

/// A job received from a queue with its delivery metadata
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job: DispatchJob,
    pub receipt_handle: String,
    /// How many times the broker has handed this job out, including this delivery
    pub receive_count: u32,
    pub queue_identifier: String,
}

// ============================================================================
// Load Classification
// ============================================================================

/// Discrete load state derived from backlog depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SystemState {
    Normal,
    Busy,
    Overloaded,
    Critical,
}

impl SystemState {
    pub const ALL: [SystemState; 4] = [
        SystemState::Normal,
        SystemState::Busy,
        SystemState::Overloaded,
        SystemState::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Normal => "normal",
            SystemState::Busy => "busy",
            SystemState::Overloaded => "overloaded",
            SystemState::Critical => "critical",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label used when the state cannot be derived (store unreachable).
pub const UNKNOWN_STATE: &str = "unknown";

/// Render an optional state, `None` becoming `"unknown"`.
pub fn state_label(state: Option<SystemState>) -> &'static str {
    state.map(|s| s.as_str()).unwrap_or(UNKNOWN_STATE)
}

fn serialize_state<S: Serializer>(state: &Option<SystemState>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(state_label(*state))
}

/// Reachability of the shared counter store as seen by one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum StoreStatus {
    Connected,
    Degraded,
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Diagnostics attached to every admission decision.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct AdmissionStats {
    pub store_status: StoreStatus,
    #[serde(serialize_with = "serialize_state")]
    #[schema(value_type = String)]
    pub system_state: Option<SystemState>,
    /// Admission attempts seen in the current one-second window
    pub current_input_rps: Option<u64>,
    pub input_limit: Option<u32>,
    pub queue_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AdmissionStats {
    /// Stats for a decision taken without the counter store.
    pub fn degraded(error: impl Into<String>) -> Self {
        Self {
            store_status: StoreStatus::Degraded,
            system_state: None,
            current_input_rps: None,
            input_limit: None,
            queue_size: None,
            error: Some(error.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.store_status == StoreStatus::Degraded
    }
}

/// Read-only projection of limiter state for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct LimiterDiagnostics {
    pub store_status: StoreStatus,
    pub queue_size: u64,
    #[serde(serialize_with = "serialize_state")]
    #[schema(value_type = String)]
    pub system_state: Option<SystemState>,
    pub current_input_limit: Option<u32>,
    pub output_rps: u32,
    pub estimated_wait_seconds: f64,
    pub estimated_wait_minutes: f64,
    pub max_queue_size: u64,
    pub queue_utilization_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
