// src/post.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,                 // e.g. "urn:li:activity:7191..."
    pub published_at: DateTime<Utc>,
    pub raw_text: String,           // normalized post body
    pub media_url: Option<String>,  // first image/video/article link, if any
}

impl Post {
    /// Ordering key: publish time first, id as the stable tie-break.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.published_at, self.id.as_str())
    }

    /// Short digest of the text for logs; raw post text is never logged.
    pub fn fingerprint(&self) -> String {
        text_fingerprint(&self.raw_text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedPost {
    pub post: Post,
    pub summary: String,
    /// True when `summary` is the raw-text fallback after a failed summarization.
    pub summary_degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub post_id: String,
    pub status: u16,
    pub accepted_at: DateTime<Utc>,
    pub remote_id: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

pub fn text_fingerprint(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
