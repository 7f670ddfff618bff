// src/lock.rs
//! Lock file that keeps two runs from sharing one cursor.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::{MonitorError, Result};

/// Held for the duration of a run; the file is removed on drop, but only while
/// it still carries this holder's stamp.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    stamp: String,
}

impl RunLock {
    /// Create `path` exclusively. A lock older than `stale_after` is assumed to
    /// belong to a crashed run and is taken over.
    pub fn acquire(path: impl Into<PathBuf>, stale_after: Duration) -> Result<Self> {
        let path = path.into();
        let stamp = new_stamp();
        match create_exclusive(&path, &stamp) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !is_stale(&path, stale_after) {
                    return Err(MonitorError::RunInProgress(path));
                }
                take_over(&path, &stamp, stale_after)?;
            }
            Err(e) => return Err(MonitorError::io(&path, e)),
        }
        debug!(target: "lock", path = %path.display(), "run lock acquired");
        Ok(Self { path, stamp })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(current) if current.trim_end() == self.stamp => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(target: "lock", path = %self.path.display(), "release run lock: {e}");
                }
            }
            Ok(current) => warn!(
                target: "lock",
                path = %self.path.display(),
                holder = current.trim(),
                "run lock was taken over, leaving it in place"
            ),
            Err(e) => warn!(target: "lock", path = %self.path.display(), "release run lock: {e}"),
        }
    }
}

/// Only the process holding `<path>.takeover` may replace a stale lock, and it
/// checks staleness again once it holds it.
fn take_over(path: &Path, stamp: &str, stale_after: Duration) -> Result<()> {
    let guard = sibling(path, "takeover");
    match create_exclusive(&guard, stamp) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            // left behind by a taker that crashed; the next run gets through
            if is_stale(&guard, stale_after) {
                let _ = fs::remove_file(&guard);
            }
            return Err(MonitorError::RunInProgress(path.to_path_buf()));
        }
        Err(e) => return Err(MonitorError::io(&guard, e)),
    }
    let replaced = replace_stale(path, stamp, stale_after);
    if let Err(e) = fs::remove_file(&guard) {
        warn!(target: "lock", path = %guard.display(), "remove takeover guard: {e}");
    }
    replaced
}

fn replace_stale(path: &Path, stamp: &str, stale_after: Duration) -> Result<()> {
    if path.exists() {
        if !is_stale(path, stale_after) {
            return Err(MonitorError::RunInProgress(path.to_path_buf()));
        }
        let holder = fs::read_to_string(path).unwrap_or_default();
        warn!(
            target: "lock",
            path = %path.display(),
            holder = holder.trim(),
            "taking over stale run lock"
        );
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(MonitorError::io(path, e)),
        }
    }
    create_exclusive(path, stamp).map_err(|e| match e.kind() {
        io::ErrorKind::AlreadyExists => MonitorError::RunInProgress(path.to_path_buf()),
        _ => MonitorError::io(path, e),
    })
}

fn new_stamp() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    format!(
        "pid={} since={} seq={}",
        std::process::id(),
        chrono::Utc::now().to_rfc3339(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn sibling(path: &Path, tag: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{tag}"));
    PathBuf::from(name)
}

fn create_exclusive(path: &Path, stamp: &str) -> io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut f = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(f, "{stamp}")?;
    Ok(())
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .is_some_and(|age| age > stale_after)
}
