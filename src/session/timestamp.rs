// src/session/timestamp.rs
//! Publish-time parsing for the activity feed.
//!
//! The feed shows relative labels ("3h", "2d", "1mo") which drift between runs,
//! so the time encoded in the numeric activity id is preferred whenever the
//! post URN carries one. Label-derived times are floored to the label's unit,
//! which keeps them stable while the label itself does not change.

use chrono::{DateTime, Datelike, Duration, DurationRound, Months, NaiveDate, TimeZone, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use tracing::warn;

/// Earliest plausible activity time (the site did not exist before this).
const MIN_PLAUSIBLE_MS: i64 = 1_136_073_600_000; // 2006-01-01

/// Publish time for a post: activity id first, then the visible label.
pub fn resolve_published_at(
    urn: &str,
    label: Option<&str>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if let Some(ts) = activity_id_time(urn, now) {
        return Some(ts);
    }
    let label = label?;
    let ts = parse_relative_label(label, now)?;
    warn!(
        target: "session",
        urn,
        label,
        published_at = %ts,
        "no activity id, publish time taken from the visible label"
    );
    Some(ts)
}

/// `urn:li:activity:<id>`: the upper 41 bits of the id are epoch milliseconds.
pub fn activity_id_time(urn: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    static RE_ID: OnceCell<Regex> = OnceCell::new();
    let re = RE_ID.get_or_init(|| Regex::new(r":(?:activity|share|ugcPost):(\d{15,20})").unwrap());
    let id: u64 = re.captures(urn)?.get(1)?.as_str().parse().ok()?;
    let ms = i64::try_from(id >> 22).ok()?;
    let upper = (now + Duration::days(1)).timestamp_millis();
    if !(MIN_PLAUSIBLE_MS..=upper).contains(&ms) {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

/// Parse labels such as `"5h • Edited • 🌐"`, `"3mo"`, `"Mar 5"` or `"Mar 5, 2023"`.
pub fn parse_relative_label(label: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let cleaned = clean_label(label);
    if cleaned.is_empty() {
        return None;
    }
    let lower = cleaned.to_ascii_lowercase();
    if lower == "now" || lower == "just now" {
        return now.duration_trunc(Duration::minutes(1)).ok();
    }

    static RE_REL: OnceCell<Regex> = OnceCell::new();
    let re = RE_REL.get_or_init(|| {
        Regex::new(r"^(\d+)\s*(mo|yr|y|m|h|d|w|s)\b").unwrap()
    });
    if let Some(caps) = re.captures(&lower) {
        let n: i64 = caps[1].parse().ok()?;
        let n_u32 = u32::try_from(n).ok()?;
        return match &caps[2] {
            "s" => (now - Duration::seconds(n)).duration_trunc(Duration::minutes(1)).ok(),
            "m" => (now - Duration::minutes(n)).duration_trunc(Duration::minutes(1)).ok(),
            "h" => (now - Duration::hours(n)).duration_trunc(Duration::hours(1)).ok(),
            "d" => (now - Duration::days(n)).duration_trunc(Duration::days(1)).ok(),
            "w" => (now - Duration::weeks(n)).duration_trunc(Duration::days(1)).ok(),
            "mo" => month_start(now.checked_sub_months(Months::new(n_u32))?),
            "yr" | "y" => {
                let then = now.checked_sub_months(Months::new(n_u32.checked_mul(12)?))?;
                Utc.with_ymd_and_hms(then.year(), 1, 1, 0, 0, 0).single()
            }
            _ => None,
        };
    }

    parse_absolute_date(&cleaned, now)
}

fn month_start(ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0).single()
}

fn clean_label(label: &str) -> String {
    let head = label.split('•').next().unwrap_or_default();
    head.replace("Liked", "")
        .replace("Edited", "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_absolute_date(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    for fmt in ["%b %d, %Y", "%B %d, %Y", "%Y-%m-%d", "%d %b %Y", "%d %B %Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d.and_hms_opt(0, 0, 0)?.and_utc());
        }
    }
    // year-less: this year, unless that lands in the future
    for fmt in ["%b %d", "%B %d", "%d %b", "%d %B"] {
        let with_year = format!("{s} {}", now.year());
        if let Ok(d) = NaiveDate::parse_from_str(&with_year, &format!("{fmt} %Y")) {
            let dt = d.and_hms_opt(0, 0, 0)?.and_utc();
            if dt > now {
                return d.with_year(now.year() - 1)?.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
            }
            return Some(dt);
        }
    }
    None
}
