// src/metrics.rs
use std::net::SocketAddr;

use anyhow::Context;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;

/// Install the Prometheus recorder with its own `/metrics` HTTP listener.
/// Without a call to this, every metric macro in the crate is a no-op.
pub fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("installing prometheus exporter on {addr}"))?;
    describe();
    tracing::info!(%addr, "metrics listener started");
    Ok(())
}

/// Register metric descriptions once per process.
pub fn describe() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pw_runs_total", "Pipeline runs started");
        describe_counter!("pw_run_failures_total", "Aborted runs, by error kind");
        describe_histogram!("pw_run_duration_seconds", Unit::Seconds, "Wall time of one run");
        describe_gauge!("pw_run_state", "Current pipeline state (ordinal)");
        describe_counter!("pw_posts_fetched_total", "Posts read from the profile feed");
        describe_counter!("pw_fetch_gap_total", "Runs whose fetch ended before reaching the cursor");
        describe_counter!("pw_posts_delivered_total", "Posts accepted by the backend");
        describe_counter!("pw_summary_fallbacks_total", "Posts delivered with the raw text as summary");
        describe_counter!("pw_delivery_attempts_total", "HTTP attempts against the backend");
        describe_counter!("pw_delivery_failures_total", "Deliveries given up, by kind");
        describe_gauge!("pw_cursor_timestamp_seconds", Unit::Seconds, "Cursor value as unix time");
        describe_gauge!("pw_scheduler_last_run_ts", Unit::Seconds, "Unix time of the last scheduled run");
    });
}
