// src/session/mod.rs
//! Browser session against the target site.
//!
//! The orchestrator only sees the two traits below; how posts are found on the
//! page is private to the driver and its extraction rules.

pub mod extract;
pub mod timestamp;
pub mod webdriver;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use crate::error::Result;
use crate::post::{Credentials, Post};

#[async_trait]
pub trait SessionDriver: Send + Sync {
    /// Open an authenticated session, logging in if the stored browser
    /// profile is not already signed in.
    async fn login(&self, credentials: &Credentials) -> Result<Box<dyn Session>>;
    fn name(&self) -> &'static str;
}

/// How far back a fetch has to reach.
///
/// `limit` posts are always wanted. With a cursor, loading goes on until the
/// feed shows a post at or before it, so nothing newer is left unread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub limit: usize,
    pub until: Option<DateTime<Utc>>,
}

impl FetchWindow {
    pub fn new(limit: usize, until: Option<DateTime<Utc>>) -> Self {
        Self { limit, until }
    }

    /// Whether `loaded` (newest first) already covers the window.
    pub fn is_covered_by(&self, loaded: &[Post]) -> bool {
        if loaded.len() < self.limit {
            return false;
        }
        match self.until {
            None => true,
            Some(until) => loaded.iter().any(|p| p.published_at <= until),
        }
    }

    /// Keep every post newer than the cursor, then fill up to `limit` in page order.
    pub fn trim(&self, loaded: Vec<Post>) -> Vec<Post> {
        let mut kept = Vec::with_capacity(self.limit.min(loaded.len()));
        for post in loaded {
            let newer = self.until.is_some_and(|u| post.published_at > u);
            if newer || kept.len() < self.limit {
                kept.push(post);
            }
        }
        kept
    }
}

#[async_trait]
pub trait Session: Send {
    /// Most recent posts of the profile, newest first, covering `window`.
    async fn fetch_recent_posts(&mut self, profile_url: &Url, window: FetchWindow) -> Result<Vec<Post>>;

    /// Release the browser session. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}
