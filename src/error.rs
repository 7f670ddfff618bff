// src/error.rs
//! Error taxonomy shared by every stage of the monitor.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = MonitorError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("authentication failed after {attempts} attempt(s): {reason}")]
    AuthenticationFailed { attempts: u32, reason: String },

    #[error("navigation to {url} timed out after {secs}s")]
    NavigationTimeout { url: String, secs: u64 },

    #[error("page structure no longer matches extraction rules: {0}")]
    ParseMismatch(String),

    #[error("browser session expired (redirected to {0})")]
    SessionExpired(String),

    #[error("cursor file {path} is corrupt: {reason}")]
    StateCorruption { path: PathBuf, reason: String },

    #[error("summarization failed: {0}")]
    SummarizationFailed(String),

    #[error("backend rejected post {post_id} with status {status}: {body}")]
    DeliveryRejected {
        post_id: String,
        status: u16,
        body: String,
    },

    #[error("backend unavailable for post {post_id} after {attempts} attempt(s): {reason}")]
    DeliveryUnavailable {
        post_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("another run holds the lock {0}")]
    RunInProgress(PathBuf),

    #[error("run cancelled")]
    Cancelled,

    #[error("webdriver: {0}")]
    Browser(String),

    #[error("io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MonitorError {
    /// Stable name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed { .. } => "AuthenticationFailed",
            Self::NavigationTimeout { .. } => "NavigationTimeout",
            Self::ParseMismatch(_) => "ParseMismatch",
            Self::SessionExpired(_) => "SessionExpired",
            Self::StateCorruption { .. } => "StateCorruption",
            Self::SummarizationFailed(_) => "SummarizationFailed",
            Self::DeliveryRejected { .. } => "DeliveryRejected",
            Self::DeliveryUnavailable { .. } => "DeliveryUnavailable",
            Self::RunInProgress(_) => "RunInProgress",
            Self::Cancelled => "Cancelled",
            Self::Browser(_) => "Browser",
            Self::Io { .. } => "Io",
        }
    }

    /// Errors after which the scheduler must stop instead of trying again next tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StateCorruption { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<fantoccini::error::CmdError> for MonitorError {
    fn from(e: fantoccini::error::CmdError) -> Self {
        Self::Browser(e.to_string())
    }
}

impl From<fantoccini::error::NewSessionError> for MonitorError {
    fn from(e: fantoccini::error::NewSessionError) -> Self {
        Self::Browser(format!("cannot open session: {e}"))
    }
}
