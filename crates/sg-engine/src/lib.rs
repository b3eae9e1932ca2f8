//! Surgegate admission and dispatch core
//!
//! This crate provides:
//! - Classifier: load state from backlog depth
//! - AdmissionController: per-second admission windows with state-dependent limits
//! - Sequencer: global admission order
//! - BacklogTracker: shared count of admitted, unfinished requests
//! - OutputPacer: global minimum spacing between downstream dispatches
//! - DispatchWorker / Dispatcher: bounded-retry dispatch driven by the queue
//! - Housekeeper: cleanup of stale admission window keys
//! - IngressService / StatsAggregator: the inbound pipeline and reporting
//! - API: HTTP endpoints for admission, status, monitoring and health

pub mod admission;
pub mod api;
pub mod backlog;
pub mod classifier;
pub mod dispatcher;
pub mod downstream;
pub mod error;
pub mod housekeeping;
pub mod metrics;
pub mod pacer;
pub mod sequencer;
pub mod service;
pub mod stats;
pub mod worker;

pub use admission::{AdmissionController, AdmissionDecision};
pub use api::{create_router, AppState};
pub use backlog::BacklogTracker;
pub use classifier::Classifier;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use downstream::{Downstream, HttpDownstream, MockDownstream};
pub use error::EngineError;
pub use housekeeping::{Housekeeper, SweepOutcome};
pub use pacer::{OutputPacer, PacerSlot};
pub use sequencer::{Sequence, Sequencer};
pub use service::{IngressService, SubmitOutcome};
pub use stats::{recommendations, RequestMonitor, StatsAggregator};
pub use worker::{DispatchOutcome, DispatchWorker, WorkerConfig};

pub type Result<T> = std::result::Result<T, EngineError>;
