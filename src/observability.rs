use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const REQUESTS_TOTAL: &str = "holdfast_requests_total";

/// Histogram: request latency in seconds. Labels: route.
pub const REQUEST_DURATION_SECONDS: &str = "holdfast_request_duration_seconds";

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: pending holds placed.
pub const HOLDS_CREATED_TOTAL: &str = "holdfast_holds_created_total";

/// Counter: hold requests rejected because the slot was taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "holdfast_slot_conflicts_total";

/// Counter: explicit transitions. Labels: action.
pub const TRANSITIONS_TOTAL: &str = "holdfast_transitions_total";

/// Counter: sweep passes run (skipped passes excluded).
pub const SWEEPS_TOTAL: &str = "holdfast_sweeps_total";

/// Counter: holds the sweeper failed to expire. Retried next pass.
pub const SWEEP_FAILURES_TOTAL: &str = "holdfast_sweep_failures_total";

/// Counter: holds cancelled by the timeout sweeper.
pub const HOLDS_EXPIRED_TOTAL: &str = "holdfast_holds_expired_total";

/// Histogram: sweep pass duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "holdfast_sweep_duration_seconds";

// ── Settlement ──────────────────────────────────────────────────

/// Counter: settlement attempts. Labels: outcome.
pub const SETTLEMENTS_TOTAL: &str = "holdfast_settlements_total";

/// Counter: rejected payment or webhook signatures.
pub const SIGNATURE_FAILURES_TOTAL: &str = "holdfast_signature_failures_total";

/// Counter: captured payments owed back to the consumer.
pub const REFUNDS_FLAGGED_TOTAL: &str = "holdfast_refunds_flagged_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open websocket subscriptions.
pub const SUBSCRIBERS_ACTIVE: &str = "holdfast_subscribers_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "holdfast_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "holdfast_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "holdfast_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
