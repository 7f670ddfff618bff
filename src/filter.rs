// src/filter.rs
//! Change filter: which fetched posts have not been delivered yet.

use chrono::{DateTime, Utc};

use crate::post::Post;

/// Keep posts strictly newer than `cursor` (everything when there is no cursor),
/// ordered oldest first with the post id as tie-break. Duplicate
/// `(published_at, id)` records collapse to the first one seen.
pub fn select_new(posts: Vec<Post>, cursor: Option<DateTime<Utc>>) -> Vec<Post> {
    let mut out: Vec<Post> = posts
        .into_iter()
        .filter(|p| cursor.map_or(true, |c| p.published_at > c))
        .collect();
    // stable sort keeps the first duplicate ahead of later ones
    out.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    out.dedup_by(|b, a| a.sort_key() == b.sort_key());
    out
}
