//! profile-watch: one monitoring run (or a timer loop when RUN_INTERVAL_SECS is set).
//!
//! Exit status is non-zero whenever the run did not finish cleanly; the log
//! line `run aborted` names the stage, the post and the error kind.

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use profile_watch::config::{AppConfig, LogConfig};
use profile_watch::pipeline::Pipeline;
use profile_watch::scheduler::run_scheduled;

/// `RUST_LOG` wins over `LOG_LEVEL`; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; real environment variables take precedence
    let _ = dotenvy::dotenv();

    let cfg = match AppConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing(&LogConfig {
                level: "info".to_string(),
                json: false,
            });
            return Err(e).context("refusing to start");
        }
    };
    init_tracing(&cfg.log);

    if let Some(addr) = cfg.metrics_addr {
        profile_watch::metrics::install_exporter(addr)?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            let _ = shutdown_tx.send(true);
        }
    });

    let pipeline = Pipeline::from_config(&cfg)?.with_shutdown(shutdown_rx.clone());
    info!(
        profile = %cfg.target.profile_url,
        cursor = %cfg.cursor_path.display(),
        summarizer = ?cfg.llm.mode,
        "profile-watch starting"
    );

    match cfg.run_interval {
        None => {
            pipeline.run_once().await?;
        }
        Some(interval) => {
            run_scheduled(&pipeline, interval, shutdown_rx).await?;
        }
    }
    Ok(())
}
