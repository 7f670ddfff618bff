// src/config/tuning.rs
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_TUNING_PATH: &str = "MONITOR_TUNING_PATH";
pub const DEFAULT_TUNING_PATH: &str = "config/monitor.toml";

/// What to deliver when the summarizer fails for a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SummaryFallback {
    /// Deliver the raw text as the summary, flagged as degraded.
    #[default]
    RawText,
    /// Stop the run at that post; the cursor stays before it.
    Abort,
}

/// Timeouts, bounds and retry counts. Every field has a default so a partial
/// file (or no file at all) is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tuning {
    pub fetch_limit: usize,
    pub login_attempts: u32,
    pub login_timeout_secs: u64,
    pub manual_login_wait_secs: u64,
    pub navigation_timeout_secs: u64,
    pub render_wait_secs: u64,
    pub poll_interval_ms: u64,
    pub max_scrolls: u32,
    pub scroll_wait_ms: u64,
    pub summary_timeout_secs: u64,
    pub max_input_chars: usize,
    pub max_summary_chars: usize,
    pub delivery_timeout_secs: u64,
    pub delivery_max_attempts: u32,
    pub delivery_backoff_ms: u64,
    pub delivery_max_backoff_ms: u64,
    pub lock_stale_after_secs: u64,
    pub summary_fallback: SummaryFallback,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            fetch_limit: 20,
            login_attempts: 2,
            login_timeout_secs: 30,
            manual_login_wait_secs: 300,
            navigation_timeout_secs: 30,
            render_wait_secs: 15,
            poll_interval_ms: 500,
            max_scrolls: 15,
            scroll_wait_ms: 3_500,
            summary_timeout_secs: 30,
            max_input_chars: 8_000,
            max_summary_chars: 600,
            delivery_timeout_secs: 10,
            delivery_max_attempts: 4,
            delivery_backoff_ms: 500,
            delivery_max_backoff_ms: 8_000,
            lock_stale_after_secs: 7_200,
            summary_fallback: SummaryFallback::RawText,
        }
    }
}

impl Tuning {
    pub fn validate(&self) -> Result<()> {
        if self.fetch_limit == 0 {
            bail!("fetch_limit must be at least 1");
        }
        if self.login_attempts == 0 {
            bail!("login_attempts must be at least 1");
        }
        if self.delivery_max_attempts == 0 {
            bail!("delivery_max_attempts must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be positive");
        }
        if self.max_input_chars == 0 || self.max_summary_chars == 0 {
            bail!("max_input_chars and max_summary_chars must be positive");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_after_secs)
    }
}

/// Load tunables from an explicit path. Supports TOML or JSON formats.
pub fn load_tuning_from(path: &Path) -> Result<Tuning> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading tuning from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let tuning: Tuning = if ext == "json" {
        serde_json::from_str(&content).context("parsing tuning json")?
    } else {
        toml::from_str(&content).context("parsing tuning toml")?
    };
    tuning.validate()?;
    Ok(tuning)
}

/// Resolve the tuning file:
/// 1) explicit path (from $MONITOR_TUNING_PATH), which must exist
/// 2) config/monitor.toml
/// 3) built-in defaults
pub fn load_tuning_default(explicit: Option<&str>) -> Result<Tuning> {
    if let Some(p) = explicit {
        let pb = PathBuf::from(p);
        if !pb.exists() {
            return Err(anyhow!("{ENV_TUNING_PATH} points to non-existent path {p}"));
        }
        return load_tuning_from(&pb);
    }
    let fallback = PathBuf::from(DEFAULT_TUNING_PATH);
    if fallback.exists() {
        return load_tuning_from(&fallback);
    }
    Ok(Tuning::default())
}
