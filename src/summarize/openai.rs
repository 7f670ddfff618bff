// src/summarize/openai.rs
//! OpenAI-compatible chat-completions summarizer.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{sanitize_summary, truncate_chars, Summarizer, SUMMARY_INSTRUCTION};
use crate::config::{LlmConfig, Tuning};
use crate::error::{MonitorError, Result};

pub struct OpenAiSummarizer {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_input_chars: usize,
    max_summary_chars: usize,
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Req<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct Resp {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiSummarizer {
    pub fn new(cfg: &LlmConfig, tuning: &Tuning) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("profile-watch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(tuning.summary_timeout_secs))
            .build()
            .context("building LLM http client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", cfg.api_base.trim_end_matches('/')),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            max_input_chars: tuning.max_input_chars,
            max_summary_chars: tuning.max_summary_chars,
        })
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, text: &str) -> Result<String> {
        let input = text.trim();
        if input.is_empty() {
            return Err(MonitorError::SummarizationFailed("empty input".to_string()));
        }
        let input = truncate_chars(input, self.max_input_chars);

        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SUMMARY_INSTRUCTION,
                },
                Msg {
                    role: "user",
                    content: input,
                },
            ],
            temperature: 0.2,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                let what = if e.is_timeout() { "timed out" } else { "request failed" };
                MonitorError::SummarizationFailed(format!("{what}: {e}"))
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MonitorError::SummarizationFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate_chars(body.trim(), 200)
            )));
        }

        let body: Resp = resp
            .json()
            .await
            .map_err(|e| MonitorError::SummarizationFailed(format!("bad response body: {e}")))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let summary = sanitize_summary(&content, self.max_summary_chars);
        if summary.is_empty() {
            return Err(MonitorError::SummarizationFailed("empty completion".to_string()));
        }
        debug!(target: "summarize", model = %self.model, chars = summary.chars().count(), "summary ready");
        Ok(summary)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
