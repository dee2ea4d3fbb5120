//! Prometheus metrics and a small status API
//!
//! Exposes:
//! - Dispatch counters (issued, rejected tokens, worker pool size)
//! - Submission and receipt outcomes per action kind
//! - Nonce resync activity
//!
//! These are plain counters; no latency distributions are collected.

use crate::action::ActionKind;
use crate::dispatch::{EngineState, EngineStats};
use crate::error::{InjectorError, InjectorResult};

use axum::{extract::State, routing::get, Json, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, CounterVec, Encoder, Gauge, TextEncoder,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

lazy_static! {
    // Dispatch metrics
    pub static ref TOKENS_DISPATCHED: CounterVec = register_counter_vec!(
        "injector_tokens_dispatched_total",
        "Dispatch tokens handed to workers",
        &[]
    ).unwrap();

    pub static ref TOKENS_REJECTED: CounterVec = register_counter_vec!(
        "injector_tokens_rejected_total",
        "Dispatch tokens rejected because the worker pool was at its limit",
        &[]
    ).unwrap();

    pub static ref WORKERS: Gauge = register_gauge!(
        "injector_workers",
        "Current size of the dispatch worker pool"
    ).unwrap();

    pub static ref IN_FLIGHT: Gauge = register_gauge!(
        "injector_submissions_in_flight",
        "Submission tasks that have not finished yet"
    ).unwrap();

    // Submission metrics
    pub static ref ACTIONS_SUBMITTED: CounterVec = register_counter_vec!(
        "injector_actions_submitted_total",
        "Actions accepted by the node",
        &["kind"]
    ).unwrap();

    pub static ref ACTIONS_DROPPED: CounterVec = register_counter_vec!(
        "injector_actions_dropped_total",
        "Actions abandoned after exhausting retries",
        &["kind"]
    ).unwrap();

    pub static ref RECEIPTS: CounterVec = register_counter_vec!(
        "injector_receipts_total",
        "Receipt checks by result",
        &["result"]
    ).unwrap();

    // Nonce metrics
    pub static ref NONCE_RESYNCS: CounterVec = register_counter_vec!(
        "injector_nonce_resyncs_total",
        "Completed nonce resynchronization passes",
        &[]
    ).unwrap();

    pub static ref NONCE_DRIFT: CounterVec = register_counter_vec!(
        "injector_nonce_drift_total",
        "Addresses whose cached nonce differed from the node at resync",
        &[]
    ).unwrap();
}

/// Shared state behind the status routes
#[derive(Clone)]
pub struct AppState {
    pub session_id: String,
    pub stats: Arc<EngineStats>,
    pub engine_state: watch::Receiver<EngineState>,
    pub started: Instant,
}

/// Prometheus metrics and status server
pub struct MetricsServer {
    port: u16,
    state: AppState,
}

impl MetricsServer {
    pub fn new(port: u16, state: AppState) -> Self {
        Self { port, state }
    }

    pub async fn run(self) -> InjectorResult<()> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| InjectorError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| InjectorError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Health check endpoint - basic liveness
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Dispatch engine status
async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let stats = state.stats.snapshot();
    Json(StatusResponse {
        session_id: state.session_id.clone(),
        engine_state: *state.engine_state.borrow(),
        uptime_seconds: state.started.elapsed().as_secs(),
        dispatched: stats.dispatched,
        rejected: stats.rejected,
        workers: stats.workers,
        in_flight: stats.in_flight,
    })
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct StatusResponse {
    session_id: String,
    engine_state: EngineState,
    uptime_seconds: u64,
    dispatched: u64,
    rejected: u64,
    workers: usize,
    in_flight: usize,
}

// Helper functions to record metrics

pub fn record_dispatched() {
    TOKENS_DISPATCHED.with_label_values(&[]).inc();
}

pub fn record_rejected() {
    TOKENS_REJECTED.with_label_values(&[]).inc();
}

pub fn record_workers(count: usize) {
    WORKERS.set(count as f64);
}

pub fn record_in_flight(count: usize) {
    IN_FLIGHT.set(count as f64);
}

pub fn record_submitted(kind: ActionKind) {
    ACTIONS_SUBMITTED.with_label_values(&[kind.as_str()]).inc();
}

pub fn record_submission_failed(kind: ActionKind) {
    ACTIONS_DROPPED.with_label_values(&[kind.as_str()]).inc();
}

pub fn record_receipt(success: bool) {
    let result = if success { "success" } else { "failure" };
    RECEIPTS.with_label_values(&[result]).inc();
}

pub fn record_resync() {
    NONCE_RESYNCS.with_label_values(&[]).inc();
}

pub fn record_nonce_drift() {
    NONCE_DRIFT.with_label_values(&[]).inc();
}
