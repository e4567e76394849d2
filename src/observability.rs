use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: lifecycle transitions performed. Labels: transition.
pub const TRANSITIONS_TOTAL: &str = "slotbook_transitions_total";

/// Counter: timeslots considered by batch creation. Labels: outcome (created, skipped).
pub const BATCH_SLOTS_TOTAL: &str = "slotbook_batch_slots_total";

/// Counter: guest claim requests. Labels: stage (requested, confirmed), status.
pub const GUEST_REQUESTS_TOTAL: &str = "slotbook_guest_requests_total";

/// Counter: notification deliveries. Labels: kind, status.
pub const NOTIFICATIONS_TOTAL: &str = "slotbook_notifications_total";

// ── Background work ─────────────────────────────────────────────

/// Counter: windows moved by the sweeper. Labels: to (completed, expired, expired_slot).
pub const SWEEP_TRANSITIONS_TOTAL: &str = "slotbook_sweep_transitions_total";

/// Histogram: duration of one sweeper pass in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "slotbook_sweep_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of resources held in memory.
pub const RESOURCES_ACTIVE: &str = "slotbook_resources_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Histogram: transaction commit latency in seconds, WAL included.
pub const COMMIT_DURATION_SECONDS: &str = "slotbook_commit_duration_seconds";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

pub fn record_transition(transition: &'static str) {
    metrics::counter!(TRANSITIONS_TOTAL, "transition" => transition).increment(1);
}
