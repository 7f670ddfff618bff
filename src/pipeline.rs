// src/pipeline.rs
//! One monitoring run: lock, read cursor, fetch, filter, then summarize and
//! deliver each new post oldest first, advancing the cursor after every
//! confirmed delivery.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{AppConfig, SummaryFallback, Tuning};
use crate::cursor::{format_cursor, CursorStore};
use crate::deliver::{DeliveryClient, PostSink};
use crate::error::{MonitorError, Result};
use crate::filter::select_new;
use crate::lock::RunLock;
use crate::post::{Credentials, EnrichedPost, Post};
use crate::session::webdriver::WebDriverDriver;
use crate::session::{FetchWindow, SessionDriver};
use crate::summarize::{build_summarizer, Summarizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    FetchingSession,
    Fetching,
    Filtering,
    Summarizing,
    Delivering,
    Advancing,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "Idle",
            RunState::FetchingSession => "FetchingSession",
            RunState::Fetching => "Fetching",
            RunState::Filtering => "Filtering",
            RunState::Summarizing => "Summarizing",
            RunState::Delivering => "Delivering",
            RunState::Advancing => "Advancing",
            RunState::Failed => "Failed",
        }
    }

    fn ordinal(&self) -> f64 {
        *self as u8 as f64
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub fetched: usize,
    pub selected: usize,
    pub delivered: Vec<String>,
    /// Delivered with the raw text standing in for the summary.
    pub degraded: Vec<String>,
    pub cursor_before: Option<DateTime<Utc>>,
    pub cursor_after: Option<DateTime<Utc>>,
    /// The fetch never reached the cursor; older posts may have been missed.
    pub fetch_gap: bool,
    pub final_state: RunState,
}

/// Why a run stopped. The cursor already reflects `delivered_before_failure`
/// (minus an unfinished equal-timestamp group).
#[derive(Debug)]
pub struct RunFailure {
    pub stage: RunState,
    pub post_id: Option<String>,
    pub error: MonitorError,
    pub delivered_before_failure: Vec<String>,
    pub cursor_after: Option<DateTime<Utc>>,
}

impl RunFailure {
    fn new(stage: RunState, error: MonitorError) -> Self {
        Self {
            stage,
            post_id: None,
            error,
            delivered_before_failure: Vec::new(),
            cursor_after: None,
        }
    }

    fn at_post(
        stage: RunState,
        post: &Post,
        error: MonitorError,
        delivered: &[String],
        cursor_after: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            stage,
            post_id: Some(post.id.clone()),
            error,
            delivered_before_failure: delivered.to_vec(),
            cursor_after,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }

    pub fn is_fatal(&self) -> bool {
        self.error.is_fatal()
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run failed in {} ({})", self.stage, self.error.kind())?;
        if let Some(id) = &self.post_id {
            write!(f, " at post {id}")?;
        }
        write!(f, ": {}", self.error)
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub struct Pipeline {
    driver: Arc<dyn SessionDriver>,
    summarizer: Arc<dyn Summarizer>,
    sink: Arc<dyn PostSink>,
    cursor: CursorStore,
    credentials: Credentials,
    profile_url: Url,
    fetch_limit: usize,
    fallback: SummaryFallback,
    lock: Option<(PathBuf, Duration)>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Pipeline {
    pub fn new(
        driver: Arc<dyn SessionDriver>,
        summarizer: Arc<dyn Summarizer>,
        sink: Arc<dyn PostSink>,
        cursor: CursorStore,
        credentials: Credentials,
        profile_url: Url,
        tuning: &Tuning,
    ) -> Self {
        Self {
            driver,
            summarizer,
            sink,
            cursor,
            credentials,
            profile_url,
            fetch_limit: tuning.fetch_limit,
            fallback: tuning.summary_fallback,
            lock: None,
            shutdown: None,
        }
    }

    /// Production wiring: WebDriver session, configured summarizer, HTTP delivery.
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let driver = Arc::new(WebDriverDriver::from_config(cfg));
        let summarizer = build_summarizer(cfg)?;
        let sink = Arc::new(DeliveryClient::new(&cfg.backend, &cfg.tuning)?);
        Ok(Self::new(
            driver,
            summarizer,
            sink,
            CursorStore::new(&cfg.cursor_path),
            cfg.target.credentials.clone(),
            cfg.target.profile_url.clone(),
            &cfg.tuning,
        )
        .with_lock(cfg.lock_path.clone(), cfg.tuning.lock_stale_after()))
    }

    pub fn with_lock(mut self, path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        self.lock = Some((path.into(), stale_after));
        self
    }

    /// `true` on the channel aborts a fetch in flight and stops between posts.
    pub fn with_shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    pub fn cursor(&self) -> &CursorStore {
        &self.cursor
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn transition(&self, state: RunState) {
        debug!(target: "pipeline", state = %state, "state");
        gauge!("pw_run_state").set(state.ordinal());
    }

    /// Race `fut` against the shutdown signal.
    async fn cancellable<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let Some(rx) = self.shutdown.clone() else {
            return fut.await;
        };
        tokio::select! {
            res = fut => res,
            _ = shutdown_requested(rx) => Err(MonitorError::Cancelled),
        }
    }

    pub async fn run_once(&self) -> std::result::Result<RunReport, RunFailure> {
        let started = Instant::now();
        counter!("pw_runs_total").increment(1);
        let result = self.run_inner().await;
        histogram!("pw_run_duration_seconds").record(started.elapsed().as_secs_f64());

        match &result {
            Ok(report) => {
                self.transition(RunState::Idle);
                info!(
                    target: "pipeline",
                    fetched = report.fetched,
                    selected = report.selected,
                    delivered = report.delivered.len(),
                    degraded = report.degraded.len(),
                    cursor = %report.cursor_after.map(format_cursor).unwrap_or_default(),
                    "run finished"
                );
            }
            Err(f) => {
                self.transition(RunState::Failed);
                counter!("pw_run_failures_total", "kind" => f.kind()).increment(1);
                error!(
                    target: "pipeline",
                    stage = %f.stage,
                    post_id = f.post_id.as_deref().unwrap_or("-"),
                    kind = f.kind(),
                    delivered = f.delivered_before_failure.len(),
                    cursor = %f.cursor_after.map(format_cursor).unwrap_or_default(),
                    error = %f.error,
                    "run aborted"
                );
            }
        }
        result
    }

    async fn run_inner(&self) -> std::result::Result<RunReport, RunFailure> {
        let _lock = match &self.lock {
            Some((path, stale_after)) => Some(
                RunLock::acquire(path.clone(), *stale_after)
                    .map_err(|e| RunFailure::new(RunState::Idle, e))?,
            ),
            None => None,
        };

        let cursor_before = self
            .cursor
            .read()
            .map_err(|e| RunFailure::new(RunState::Idle, e))?;
        info!(
            target: "pipeline",
            cursor = %cursor_before.map(format_cursor).unwrap_or_else(|| "<empty>".to_string()),
            driver = self.driver.name(),
            summarizer = self.summarizer.name(),
            "run started"
        );

        let window = FetchWindow::new(self.fetch_limit, cursor_before);
        let posts = self.fetch(window).await.map_err(|(stage, e)| {
            let mut f = RunFailure::new(stage, e);
            f.cursor_after = cursor_before;
            f
        })?;
        let fetched = posts.len();
        counter!("pw_posts_fetched_total").increment(fetched as u64);

        let fetch_gap = reaches_short_of(&posts, cursor_before, self.fetch_limit);
        if fetch_gap {
            counter!("pw_fetch_gap_total").increment(1);
            warn!(
                target: "pipeline",
                fetched,
                oldest = %posts.iter().map(|p| p.published_at).min().map(format_cursor).unwrap_or_default(),
                cursor = %cursor_before.map(format_cursor).unwrap_or_default(),
                "feed did not reach the cursor; posts between the two were not fetched"
            );
        }

        self.transition(RunState::Filtering);
        // the site lists newest first; select_new orders oldest first
        let selected = select_new(posts, cursor_before);
        info!(target: "pipeline", fetched, selected = selected.len(), "filtered against cursor");

        let mut current = cursor_before;
        let mut delivered: Vec<String> = Vec::new();
        let mut degraded: Vec<String> = Vec::new();

        for (i, post) in selected.iter().enumerate() {
            if self.is_cancelled() {
                return Err(RunFailure::at_post(
                    RunState::Summarizing,
                    post,
                    MonitorError::Cancelled,
                    &delivered,
                    current,
                ));
            }

            self.transition(RunState::Summarizing);
            let enriched = match self.summarizer.summarize(&post.raw_text).await {
                Ok(summary) => EnrichedPost {
                    post: post.clone(),
                    summary,
                    summary_degraded: false,
                },
                Err(e) => match self.fallback {
                    SummaryFallback::RawText => {
                        warn!(
                            target: "pipeline",
                            post_id = %post.id,
                            text_fp = %post.fingerprint(),
                            error = %e,
                            "summary failed, delivering raw text"
                        );
                        counter!("pw_summary_fallbacks_total").increment(1);
                        degraded.push(post.id.clone());
                        EnrichedPost {
                            post: post.clone(),
                            summary: post.raw_text.clone(),
                            summary_degraded: true,
                        }
                    }
                    SummaryFallback::Abort => {
                        return Err(RunFailure::at_post(
                            RunState::Summarizing,
                            post,
                            e,
                            &delivered,
                            current,
                        ));
                    }
                },
            };

            self.transition(RunState::Delivering);
            let receipt = self.sink.deliver(&enriched).await.map_err(|e| {
                RunFailure::at_post(RunState::Delivering, post, e, &delivered, current)
            })?;
            delivered.push(post.id.clone());
            counter!("pw_posts_delivered_total").increment(1);
            debug!(
                target: "pipeline",
                post_id = %receipt.post_id,
                status = receipt.status,
                text_fp = %post.fingerprint(),
                "delivery confirmed"
            );

            // one scalar cannot tell equal timestamps apart: move only past the whole group
            let group_continues = selected
                .get(i + 1)
                .is_some_and(|next| next.published_at == post.published_at);
            if group_continues {
                debug!(target: "pipeline", post_id = %post.id, "cursor advance deferred to end of equal-timestamp group");
                continue;
            }

            self.transition(RunState::Advancing);
            let now_at = self
                .cursor
                .advance(current, post.published_at)
                .map_err(|e| RunFailure::at_post(RunState::Advancing, post, e, &delivered, current))?;
            current = Some(now_at);
            gauge!("pw_cursor_timestamp_seconds").set(now_at.timestamp() as f64);
        }

        Ok(RunReport {
            fetched,
            selected: selected.len(),
            delivered,
            degraded,
            cursor_before,
            cursor_after: current,
            fetch_gap,
            final_state: RunState::Idle,
        })
    }

    /// Login + fetch. The session is closed right after the fetch on every
    /// path; an expired session gets exactly one fresh login.
    async fn fetch(
        &self,
        window: FetchWindow,
    ) -> std::result::Result<Vec<Post>, (RunState, MonitorError)> {
        let mut relogged = false;
        loop {
            self.transition(RunState::FetchingSession);
            let mut session = self
                .cancellable(self.driver.login(&self.credentials))
                .await
                .map_err(|e| (RunState::FetchingSession, e))?;

            self.transition(RunState::Fetching);
            let fetched = self
                .cancellable(session.fetch_recent_posts(&self.profile_url, window))
                .await;
            if let Err(e) = session.close().await {
                warn!(target: "pipeline", error = %e, "closing browser session failed");
            }

            match fetched {
                Err(MonitorError::SessionExpired(at)) if !relogged => {
                    warn!(target: "pipeline", redirected_to = %at, "session expired during fetch, logging in again");
                    relogged = true;
                }
                Err(e) => return Err((RunState::Fetching, e)),
                Ok(posts) => return Ok(posts),
            }
        }
    }
}

/// A full fetch whose every post is still newer than the cursor left a hole
/// behind it.
fn reaches_short_of(posts: &[Post], cursor: Option<DateTime<Utc>>, limit: usize) -> bool {
    let Some(cursor) = cursor else {
        return false;
    };
    posts.len() >= limit && posts.iter().all(|p| p.published_at > cursor)
}

/// Resolves once `true` is observed. A dropped sender never cancels.
pub(crate) async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
