// src/cursor.rs
//! Flat-file cursor: one UTC timestamp marking the newest delivered post.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use tracing::{info, warn};

use crate::error::{MonitorError, Result};

pub const DEFAULT_CURSOR_PATH: &str = "last_timestamp.txt";

#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` means "no history": the file is missing or blank.
    /// Anything else that does not parse is corruption, never a guess.
    pub fn read(&self) -> Result<Option<DateTime<Utc>>> {
        let raw = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(MonitorError::StateCorruption {
                    path: self.path.clone(),
                    reason: format!("unreadable: {e}"),
                })
            }
        };
        let text = String::from_utf8(raw).map_err(|_| MonitorError::StateCorruption {
            path: self.path.clone(),
            reason: "not valid UTF-8".to_string(),
        })?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        parse_cursor(trimmed)
            .map(Some)
            .ok_or_else(|| MonitorError::StateCorruption {
                path: self.path.clone(),
                reason: format!("unparseable timestamp {trimmed:?}"),
            })
    }

    /// Replace the stored value atomically (temp file + fsync + rename).
    pub fn write(&self, ts: DateTime<Utc>) -> Result<()> {
        let tmp = tmp_path(&self.path);
        let line = format_cursor(ts);
        let res = (|| -> io::Result<()> {
            if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
            let mut f = fs::File::create(&tmp)?;
            f.write_all(line.as_bytes())?;
            f.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();
        if let Err(e) = res {
            let _ = fs::remove_file(&tmp);
            return Err(MonitorError::io(&self.path, e));
        }
        info!(target: "cursor", cursor = %line, "cursor saved");
        Ok(())
    }

    /// Persist `next` unless it would move the cursor backwards.
    /// Returns the value now in effect.
    pub fn advance(
        &self,
        previous: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        if let Some(prev) = previous {
            if next < prev {
                warn!(
                    target: "cursor",
                    previous = %format_cursor(prev),
                    refused = %format_cursor(next),
                    "refusing to move cursor backwards"
                );
                return Ok(prev);
            }
            if next == prev {
                return Ok(prev);
            }
        }
        self.write(next)?;
        Ok(next)
    }
}

pub fn format_cursor(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// RFC 3339 with any offset, or a naive timestamp taken as UTC.
pub fn parse_cursor(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|n| n.and_utc())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "cursor".into());
    name.push(".tmp");
    path.with_file_name(name)
}
