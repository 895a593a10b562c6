use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: bookings created. Labels: none.
pub const BOOKINGS_CREATED_TOTAL: &str = "caravel_bookings_created_total";

/// Counter: booking state transitions. Labels: status.
pub const TRANSITIONS_TOTAL: &str = "caravel_transitions_total";

/// Counter: booking attempts denied for lack of availability.
pub const HOLDS_DENIED_TOTAL: &str = "caravel_holds_denied_total";

/// Counter: webhook events received. Labels: outcome (ack, duplicate,
/// rejected, invalid_signature).
pub const WEBHOOK_EVENTS_TOTAL: &str = "caravel_webhook_events_total";

/// Counter: refunds requested from the gateway.
pub const REFUNDS_REQUESTED_TOTAL: &str = "caravel_refunds_requested_total";

/// Counter: gateway calls retried after transient failures.
pub const GATEWAY_RETRIES_TOTAL: &str = "caravel_gateway_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: holds released by the reaper after TTL lapse.
pub const HOLDS_REAPED_TOTAL: &str = "caravel_holds_reaped_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "caravel_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "caravel_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
