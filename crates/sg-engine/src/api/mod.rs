//! Surgegate HTTP API
//!
//! HTTP API endpoints for:
//! - Request admission (`POST /api/process`)
//! - Request status lookup
//! - Monitoring snapshots and system status
//! - Health and Prometheus metrics

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use sg_common::{state_label, AdmissionStats, LimiterDiagnostics, RequestRecord, RequestStatus, StoreStatus};
use sg_records::RecordStore;
use sg_store::CounterStore;

use crate::service::{IngressService, SubmitOutcome};
use crate::stats::{MonitorSnapshot, MonitoringSnapshot, QueueManagement, QueueSnapshot, StatsAggregator, SystemStatus};

pub mod model;

use model::{ErrorResponse, HealthResponse, ProcessResponse, RateLimitDetail, RateLimitResponse, RootResponse};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingress: Arc<IngressService>,
    pub records: Arc<dyn RecordStore>,
    pub stats: StatsAggregator,
    pub store: Arc<dyn CounterStore>,
    /// Installed Prometheus recorder, if any
    pub prometheus: Option<PrometheusHandle>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Surgegate API",
        version = "0.1.0",
        description = "Adaptive admission control in front of a rate-limited downstream"
    ),
    paths(
        root_handler,
        process_handler,
        status_handler,
        monitoring_handler,
        system_status_handler,
        health_handler,
        metrics_handler,
    ),
    components(schemas(
        ProcessResponse,
        RateLimitResponse,
        RateLimitDetail,
        ErrorResponse,
        RootResponse,
        HealthResponse,
        AdmissionStats,
        LimiterDiagnostics,
        MonitorSnapshot,
        MonitoringSnapshot,
        QueueManagement,
        QueueSnapshot,
        SystemStatus,
        RequestRecord,
        RequestStatus,
        StoreStatus,
    )),
    tags(
        (name = "requests", description = "Request admission and status"),
        (name = "monitoring", description = "Monitoring and metrics endpoints"),
        (name = "health", description = "Health check endpoints"),
    )
)]
pub struct ApiDoc;

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .route("/", get(root_handler))
        .route("/api/process", post(process_handler))
        .route("/api/status/{id}", get(status_handler))
        .route("/api/monitoring", get(monitoring_handler))
        .route("/api/system-status", get(system_status_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Service name, docs link and current limiter diagnostics
#[utoipa::path(
    get,
    path = "/",
    tag = "monitoring",
    responses(
        (status = 200, description = "Service information", body = RootResponse)
    )
)]
async fn root_handler(State(state): State<AppState>) -> Json<RootResponse> {
    Json(RootResponse {
        service: "Surgegate".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        docs: "/swagger-ui".to_string(),
        adaptive: state.ingress.admission().diagnostics().await,
    })
}

/// Submit a payload for paced dispatch
#[utoipa::path(
    post,
    path = "/api/process",
    tag = "requests",
    request_body(content = Object, description = "Opaque JSON payload forwarded to the downstream"),
    responses(
        (status = 202, description = "Request queued", body = ProcessResponse),
        (status = 400, description = "Payload is not a JSON object", body = ErrorResponse),
        (status = 429, description = "Admission rejected", body = RateLimitResponse),
        (status = 503, description = "Queue unavailable", body = ErrorResponse)
    )
)]
async fn process_handler(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    if !payload.is_object() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("payload must be a JSON object")),
        )
            .into_response();
    }

    match state.ingress.submit(payload).await {
        Ok(SubmitOutcome::Queued {
            request_id,
            sequence_number,
            sequence_degraded,
            estimated_wait_minutes,
            stats,
        }) => {
            let degraded = stats.is_degraded();
            if degraded || sequence_degraded {
                warn!(
                    request_id = %request_id,
                    degraded,
                    sequence_degraded,
                    "Request queued while the counter store is degraded"
                );
            }
            (
                StatusCode::ACCEPTED,
                Json(ProcessResponse {
                    request_id,
                    status: "queued".to_string(),
                    sequence_number,
                    estimated_wait_minutes,
                    message: format!("Request queued for processing. Estimated wait: {estimated_wait_minutes} minutes"),
                    degraded,
                    sequence_degraded,
                    stats,
                }),
            )
                .into_response()
        }
        Ok(SubmitOutcome::Rejected { reason, stats }) => {
            debug!(reason = %reason, "Rejected request");
            let system_state = state_label(stats.system_state).to_string();
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, "1")],
                Json(RateLimitResponse {
                    detail: RateLimitDetail {
                        message: "Rate limit exceeded".to_string(),
                        reason,
                        stats,
                        retry_after_seconds: 1,
                        system_state,
                    },
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to queue request");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse::new(format!("Failed to queue request: {e}"))),
            )
                .into_response()
        }
    }
}

/// Look up one request record
#[utoipa::path(
    get,
    path = "/api/status/{id}",
    tag = "requests",
    params(("id" = String, Path, description = "Request ID returned by /api/process")),
    responses(
        (status = 200, description = "Request record", body = RequestRecord),
        (status = 404, description = "Unknown request", body = ErrorResponse),
        (status = 500, description = "Record store error", body = ErrorResponse)
    )
)]
async fn status_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.records.get(&id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("Request not found")),
        )
            .into_response(),
        Err(e) => {
            error!(request_id = %id, error = %e, "Failed to read request record");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(e.to_string())),
            )
                .into_response()
        }
    }
}

/// Request counters merged with limiter diagnostics
#[utoipa::path(
    get,
    path = "/api/monitoring",
    tag = "monitoring",
    responses(
        (status = 200, description = "Monitoring snapshot", body = MonitoringSnapshot)
    )
)]
async fn monitoring_handler(State(state): State<AppState>) -> Json<MonitoringSnapshot> {
    Json(state.stats.snapshot().await)
}

/// Overall status and queue management hints
#[utoipa::path(
    get,
    path = "/api/system-status",
    tag = "monitoring",
    responses(
        (status = 200, description = "System status", body = SystemStatus)
    )
)]
async fn system_status_handler(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(state.stats.system_status().await)
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = HealthResponse)
    )
)]
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_status = match state.store.ping().await {
        Ok(()) => StoreStatus::Connected,
        Err(e) => {
            warn!(error = %e, "Health check: counter store unreachable");
            StoreStatus::Degraded
        }
    };

    let status = match store_status {
        StoreStatus::Connected => "UP",
        StoreStatus::Degraded => "DEGRADED",
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store_backend: state.store.backend().to_string(),
        store_status,
    })
}

/// Prometheus metrics endpoint
#[utoipa::path(
    get,
    path = "/metrics",
    tag = "monitoring",
    responses(
        (status = 200, description = "Prometheus metrics", content_type = "text/plain")
    )
)]
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let output = state.prometheus.as_ref().map(PrometheusHandle::render).unwrap_or_default();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::sequencer::Sequencer;
    use crate::stats::RequestMonitor;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use sg_config::AdmissionConfig;
    use sg_queue::InMemoryQueue;
    use sg_records::InMemoryRecordStore;
    use sg_store::{CounterKeys, InMemoryCounterStore, UnreachableCounterStore};
    use tower::ServiceExt;

    fn app_with(store: Arc<dyn CounterStore>, config: AdmissionConfig) -> (Router, AppState) {
        let keys = CounterKeys::new("t");
        let records: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let monitor = Arc::new(RequestMonitor::new());
        let admission = Arc::new(AdmissionController::new(store.clone(), keys.clone(), &config, 60));
        let queue = Arc::new(InMemoryQueue::new("q", 30));
        let ingress = IngressService::new(
            admission.clone(),
            Sequencer::new(store.clone(), &keys),
            records.clone(),
            queue.clone(),
            monitor.clone(),
        );
        let state = AppState {
            ingress: Arc::new(ingress),
            records,
            stats: StatsAggregator::new(admission, monitor).with_queue(queue),
            store,
            prometheus: None,
        };
        (create_router(state.clone()), state)
    }

    fn app() -> (Router, AppState) {
        app_with(Arc::new(InMemoryCounterStore::new()), AdmissionConfig::default())
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_process_then_status() {
        let (router, _) = app();

        let (status, body) = send(&router, post_json("/api/process", json!({"prompt": "hello"}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "queued");
        assert_eq!(body["sequence_number"], 1);
        assert_eq!(body["degraded"], false);
        assert_eq!(body["sequence_degraded"], false);
        assert_eq!(body["stats"]["store_status"], "connected");

        let id = body["request_id"].as_str().unwrap().to_string();
        let (status, body) = send(&router, get_req(&format!("/api/status/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["payload"]["prompt"], "hello");
    }

    #[tokio::test]
    async fn test_rejection_is_429_with_detail() {
        let config = AdmissionConfig {
            normal_rps: 1,
            ..AdmissionConfig::default()
        };
        let (router, _) = app_with(Arc::new(InMemoryCounterStore::new()), config);

        // A second-boundary rollover can admit one extra request
        let mut rejection = None;
        for _ in 0..3 {
            let (status, body) = send(&router, post_json("/api/process", json!({}))).await;
            if status == StatusCode::TOO_MANY_REQUESTS {
                rejection = Some(body);
                break;
            }
        }

        let body = rejection.expect("expected a 429");
        assert_eq!(body["detail"]["message"], "Rate limit exceeded");
        assert_eq!(body["detail"]["retry_after_seconds"], 1);
        assert_eq!(body["detail"]["system_state"], "normal");
        assert_eq!(body["detail"]["reason"], "Input rate limit exceeded: 2/1 RPS");
    }

    #[tokio::test]
    async fn test_non_object_payload_is_400() {
        let (router, _) = app();
        let (status, _) = send(&router, post_json("/api/process", json!([1, 2, 3]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_status_is_404() {
        let (router, _) = app();
        let (status, body) = send(&router, get_req("/api/status/does-not-exist")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Request not found");
    }

    #[tokio::test]
    async fn test_monitoring_and_system_status() {
        let (router, state) = app();
        state.ingress.admission().backlog().reset_to(750).await.unwrap();

        let (status, body) = send(&router, get_req("/api/monitoring")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["adaptive"]["system_state"], "overloaded");
        assert_eq!(body["adaptive"]["current_input_limit"], 80);
        assert!(body["recommendations"].as_array().unwrap().len() >= 2);
        assert_eq!(body["queue"]["name"], "q");
        assert_eq!(body["queue"]["pending_jobs"], 0);

        let (status, body) = send(&router, get_req("/api/system-status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "warning");
        assert_eq!(body["queue_management"]["should_reduce_input"], true);
    }

    #[tokio::test]
    async fn test_health_reports_store_state() {
        let (router, _) = app();
        let (_, body) = send(&router, get_req("/health")).await;
        assert_eq!(body["status"], "UP");
        assert_eq!(body["store_backend"], "memory");

        let (router, _) = app_with(Arc::new(UnreachableCounterStore::new("down")), AdmissionConfig::default());
        let (status, body) = send(&router, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "DEGRADED");
        assert_eq!(body["store_status"], "degraded");
    }

    #[tokio::test]
    async fn test_degraded_admission_still_queues() {
        let (router, _) = app_with(Arc::new(UnreachableCounterStore::new("down")), AdmissionConfig::default());
        let (status, body) = send(&router, post_json("/api/process", json!({"prompt": "x"}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "queued");
        assert_eq!(body["degraded"], true);
        assert_eq!(body["sequence_degraded"], true);
        assert_eq!(body["stats"]["store_status"], "degraded");
        assert_eq!(body["stats"]["system_state"], "unknown");
        assert_eq!(body["stats"]["error"], "Counter store unavailable: down");
    }

    #[tokio::test]
    async fn test_metrics_without_recorder_is_empty() {
        let (router, _) = app();
        let response = router.oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
