// src/scheduler.rs
use std::time::Duration;

use metrics::gauge;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::error::MonitorError;
use crate::pipeline::{shutdown_requested, Pipeline, RunFailure};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub runs: u64,
    pub failed_runs: u64,
}

/// Run the pipeline now and then every `interval` until shutdown.
///
/// Runs never overlap: a run longer than the interval swallows the ticks it
/// missed. Failures wait for the next tick, except fatal ones (a corrupt
/// cursor) which end the loop.
pub async fn run_scheduled(
    pipeline: &Pipeline,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<ScheduleSummary, RunFailure> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut summary = ScheduleSummary::default();
    info!(target: "scheduler", interval_secs = interval.as_secs(), "scheduler started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(shutdown.clone()) => break,
            _ = ticker.tick() => {}
        }

        let outcome = pipeline.run_once().await;
        summary.runs += 1;
        gauge!("pw_scheduler_last_run_ts").set(chrono::Utc::now().timestamp() as f64);
        match outcome {
            Ok(_) => {}
            Err(f) if f.is_fatal() => return Err(f),
            Err(f) if matches!(f.error, MonitorError::Cancelled) => {
                summary.failed_runs += 1;
                break;
            }
            Err(f) => {
                summary.failed_runs += 1;
                warn!(target: "scheduler", kind = f.kind(), "run failed; next attempt on the next tick");
            }
        }
    }

    info!(target: "scheduler", runs = summary.runs, failed = summary.failed_runs, "scheduler stopped");
    Ok(summary)
}
