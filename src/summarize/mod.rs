// src/summarize/mod.rs
//! Post summarization: provider seam, a deterministic mock and text helpers.

pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;

use crate::config::{AppConfig, SummarizerMode};
use crate::error::Result;

pub use openai::OpenAiSummarizer;

/// System instruction sent with every post.
pub const SUMMARY_INSTRUCTION: &str = "Summarize the following social-media post in one to three plain sentences. \
Keep names, numbers and links that matter. No emojis, no hashtags, no preamble. Output only the summary.";

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Condensed form of `text`. Fails with `SummarizationFailed`.
    async fn summarize(&self, text: &str) -> Result<String>;
    fn name(&self) -> &'static str;
}

pub type DynSummarizer = Arc<dyn Summarizer>;

/// Offline summarizer: the first sentence of the post, capped.
#[derive(Debug, Clone)]
pub struct MockSummarizer {
    max_chars: usize,
}

impl MockSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(&self, text: &str) -> Result<String> {
        let flat = collapse_whitespace(text);
        if flat.is_empty() {
            return Err(crate::error::MonitorError::SummarizationFailed(
                "empty input".to_string(),
            ));
        }
        Ok(sanitize_summary(first_sentence(&flat), self.max_chars))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Pick the implementation selected by `SUMMARIZER_MODE`.
pub fn build_summarizer(cfg: &AppConfig) -> anyhow::Result<DynSummarizer> {
    let summarizer: DynSummarizer = match cfg.llm.mode {
        SummarizerMode::Mock => Arc::new(MockSummarizer::new(cfg.tuning.max_summary_chars)),
        SummarizerMode::OpenAi => Arc::new(OpenAiSummarizer::new(&cfg.llm, &cfg.tuning)?),
    };
    Ok(summarizer)
}

/// At most `max` chars, never splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Single-line, trimmed, capped at `max` chars (ellipsis when cut).
pub fn sanitize_summary(s: &str, max: usize) -> String {
    let flat = collapse_whitespace(s);
    let flat = flat.trim_matches(|c: char| c == '"' || c.is_whitespace());
    if flat.chars().count() <= max {
        return flat.to_string();
    }
    let cut = truncate_chars(flat, max.saturating_sub(1)).trim_end();
    format!("{cut}…")
}

fn collapse_whitespace(s: &str) -> String {
    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());
    re.replace_all(s.trim(), " ").into_owned()
}

fn first_sentence(s: &str) -> &str {
    s.char_indices()
        .find(|&(i, c)| {
            matches!(c, '.' | '!' | '?')
                && s[i + c.len_utf8()..].starts_with(' ')
        })
        .map(|(i, c)| &s[..i + c.len_utf8()])
        .unwrap_or(s)
}
