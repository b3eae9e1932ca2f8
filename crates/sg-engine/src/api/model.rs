use serde::Serialize;
use utoipa::ToSchema;

use sg_common::{AdmissionStats, LimiterDiagnostics, StoreStatus};

/// Response for an admitted request
#[derive(Debug, Serialize, ToSchema)]
pub struct ProcessResponse {
    /// Generated request ID
    pub request_id: String,
    /// Status: queued
    pub status: String,
    /// Global admission order
    pub sequence_number: i64,
    /// Estimated time until the request is dispatched
    pub estimated_wait_minutes: f64,
    pub message: String,
    /// True when admission ran without the counter store (no limit applied)
    pub degraded: bool,
    /// True when the sequence number is clock-derived rather than from the global counter
    pub sequence_degraded: bool,
    /// Admission stats for this request
    pub stats: AdmissionStats,
}

/// Body of a 429 response
#[derive(Debug, Serialize, ToSchema)]
pub struct RateLimitResponse {
    pub detail: RateLimitDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RateLimitDetail {
    pub message: String,
    /// Why the request was rejected, e.g. "Input rate limit exceeded: 81/80 RPS"
    pub reason: String,
    pub stats: AdmissionStats,
    pub retry_after_seconds: u32,
    /// normal, busy, overloaded, critical or unknown
    pub system_state: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

/// Service landing document
#[derive(Debug, Serialize, ToSchema)]
pub struct RootResponse {
    pub service: String,
    pub version: String,
    pub docs: String,
    pub adaptive: LimiterDiagnostics,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status: UP, DEGRADED
    pub status: String,
    pub version: String,
    /// Counter store backend in use
    pub store_backend: String,
    pub store_status: StoreStatus,
}
