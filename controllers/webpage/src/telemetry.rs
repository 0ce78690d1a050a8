//! Prometheus metrics and the probe endpoint.
//!
//! Serves `/healthz`, `/readyz` and `/metrics` on the probe address. The
//! metrics registry is owned by [`Metrics`] rather than the global default
//! registry so tests can build as many as they like.

use crate::error::ControllerError;
use crate::reconciler::Outcome;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const RECONCILE_TOTAL: &str = "webpage_reconcile_total";
    pub const RECONCILE_DURATION_SECONDS: &str = "webpage_reconcile_duration_seconds";
    pub const STATUS_WRITE_FAILURES_TOTAL: &str = "webpage_status_write_failures_total";
}

/// Reconciliation metrics.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    duration: Histogram,
    status_write_failures: IntCounter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("status_write_failures", &self.status_write_failures.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create the metrics and register them with a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(names::RECONCILE_TOTAL, "Reconciliation passes by outcome"),
            &["outcome"],
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new(
                names::RECONCILE_DURATION_SECONDS,
                "Duration of reconciliation passes",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let status_write_failures = IntCounter::new(
            names::STATUS_WRITE_FAILURES_TOTAL,
            "Status updates that failed after the dependents converged",
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(status_write_failures.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            duration,
            status_write_failures,
        })
    }

    /// Record one finished pass.
    pub fn record(&self, result: &Result<Outcome, ControllerError>, elapsed: Duration) {
        let outcome = match result {
            Ok(Outcome::ParentMissing) => "parent_missing",
            Ok(Outcome::Deleting) => "deleting",
            Ok(Outcome::CleanedUp) => "cleaned_up",
            Ok(Outcome::Converged { status_written }) => {
                if !status_written {
                    self.status_write_failures.inc();
                }
                "converged"
            }
            Err(e) => e.metric_label(),
        };
        self.reconciliations.with_label_values(&[outcome]).inc();
        self.duration.observe(elapsed.as_secs_f64());
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

/// Shared state of the probe endpoint.
#[derive(Debug, Clone)]
pub struct ProbeState {
    metrics: Arc<Metrics>,
    ready: Arc<AtomicBool>,
}

impl ProbeState {
    pub fn new(metrics: Arc<Metrics>, ready: Arc<AtomicBool>) -> Self {
        Self { metrics, ready }
    }
}

/// Router for the probe endpoint.
pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ProbeState>) -> (StatusCode, &'static str) {
    if state.ready.load(Ordering::Acquire) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<ProbeState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            format!("failed to encode metrics: {e}"),
        ),
    }
}

/// Serve the probe endpoint on `addr` until the task is aborted.
pub async fn serve(addr: SocketAddr, state: ProbeState) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Server(format!("failed to bind {addr}: {e}")))?;
    info!("Probe endpoint listening on {}", addr);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| ControllerError::Server(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use cluster_store::StoreError;
    use tower::ServiceExt;

    fn state(ready: bool) -> ProbeState {
        ProbeState::new(
            Arc::new(Metrics::new().unwrap()),
            Arc::new(AtomicBool::new(ready)),
        )
    }

    async fn get_path(state: ProbeState, path: &str) -> (StatusCode, String) {
        let response = router(state)
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_healthz_always_ok() {
        let (status, body) = get_path(state(false), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_readyz_follows_flag() {
        let (status, _) = get_path(state(false), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = get_path(state(true), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_exposes_reconcile_counters() {
        let probe = state(true);
        probe
            .metrics
            .record(&Ok(Outcome::Converged { status_written: false }), Duration::from_millis(5));
        probe.metrics.record(
            &Err(ControllerError::Store(StoreError::Transient("timeout".to_string()))),
            Duration::from_millis(5),
        );

        let (status, body) = get_path(probe, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("webpage_reconcile_total{outcome=\"converged\"} 1"));
        assert!(body.contains("webpage_reconcile_total{outcome=\"store\"} 1"));
        assert!(body.contains("webpage_status_write_failures_total 1"));
        assert!(body.contains("webpage_reconcile_duration_seconds_count 2"));
    }

    #[test]
    fn test_status_written_pass_is_not_a_failure() {
        let metrics = Metrics::new().unwrap();
        metrics.record(&Ok(Outcome::Converged { status_written: true }), Duration::ZERO);
        assert_eq!(metrics.status_write_failures.get(), 0);
        assert_eq!(metrics.reconciliations.with_label_values(&["converged"]).get(), 1);
    }
}
