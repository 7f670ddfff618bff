// src/deliver.rs
//! Delivery of enriched posts to the backend API.
//!
//! 2xx is acceptance. 4xx means the payload itself is bad and is never retried,
//! except 408/429 which are the backend asking us to come back later. 5xx,
//! connect errors and timeouts are retried with capped exponential backoff.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, Tuning};
use crate::error::{MonitorError, Result};
use crate::post::{DeliveryReceipt, EnrichedPost};

#[async_trait]
pub trait PostSink: Send + Sync {
    /// Hand one post to the backend; `Ok` only on confirmed acceptance.
    async fn deliver(&self, post: &EnrichedPost) -> Result<DeliveryReceipt>;
}

/// Wire body of `POST <base>/<resource>`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload<'a> {
    pub id: &'a str,
    pub published_at: DateTime<Utc>,
    pub text: &'a str,
    pub summary: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<&'a str>,
    pub summary_degraded: bool,
}

impl<'a> From<&'a EnrichedPost> for DeliveryPayload<'a> {
    fn from(e: &'a EnrichedPost) -> Self {
        Self {
            id: &e.post.id,
            published_at: e.post.published_at,
            text: &e.post.raw_text,
            summary: &e.summary,
            media_url: e.post.media_url.as_deref(),
            summary_degraded: e.summary_degraded,
        }
    }
}

#[derive(Clone)]
pub struct DeliveryClient {
    client: Client,
    endpoint: String,
    api_token: Option<String>,
    timeout: Duration,
    max_attempts: u32,
    backoff: Duration,
    max_backoff: Duration,
}

enum Attempt {
    Accepted(DeliveryReceipt),
    Rejected { status: u16, body: String },
    Retry { reason: String, wait_hint: Option<Duration> },
}

impl DeliveryClient {
    pub fn new(cfg: &BackendConfig, tuning: &Tuning) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("profile-watch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("building backend http client")?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/{}",
                cfg.base_url.as_str().trim_end_matches('/'),
                cfg.resource.trim_matches('/')
            ),
            api_token: cfg.api_token.clone(),
            timeout: Duration::from_secs(tuning.delivery_timeout_secs),
            max_attempts: tuning.delivery_max_attempts.max(1),
            backoff: Duration::from_millis(tuning.delivery_backoff_ms),
            max_backoff: Duration::from_millis(tuning.delivery_max_backoff_ms),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Wait before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    async fn attempt(&self, payload: &DeliveryPayload<'_>) -> Attempt {
        let mut req = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(payload);
        if let Some(token) = &self.api_token {
            req = req.bearer_auth(token);
        }

        let rsp = match req.send().await {
            Ok(rsp) => rsp,
            Err(e) => {
                let what = if e.is_timeout() { "timeout" } else { "transport error" };
                return Attempt::Retry {
                    reason: format!("{what}: {e}"),
                    wait_hint: None,
                };
            }
        };

        let status = rsp.status();
        if status.is_success() {
            // acceptance bodies vary; an `id` field is kept when present
            let remote_id = rsp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| match v.get("id") {
                    Some(serde_json::Value::String(s)) => Some(s.clone()),
                    Some(serde_json::Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                });
            return Attempt::Accepted(DeliveryReceipt {
                post_id: payload.id.to_string(),
                status: status.as_u16(),
                accepted_at: Utc::now(),
                remote_id,
            });
        }

        let wait_hint = retry_after(&rsp);
        let body = rsp.text().await.unwrap_or_default();
        let body: String = body.trim().chars().take(300).collect();
        if is_retryable(status) {
            Attempt::Retry {
                reason: format!("HTTP {}: {body}", status.as_u16()),
                wait_hint,
            }
        } else {
            Attempt::Rejected {
                status: status.as_u16(),
                body,
            }
        }
    }
}

#[async_trait]
impl PostSink for DeliveryClient {
    async fn deliver(&self, post: &EnrichedPost) -> Result<DeliveryReceipt> {
        let payload = DeliveryPayload::from(post);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            counter!("pw_delivery_attempts_total").increment(1);
            match self.attempt(&payload).await {
                Attempt::Accepted(receipt) => {
                    info!(
                        target: "deliver",
                        post_id = %receipt.post_id,
                        status = receipt.status,
                        remote_id = ?receipt.remote_id,
                        attempt,
                        "post accepted"
                    );
                    return Ok(receipt);
                }
                Attempt::Rejected { status, body } => {
                    counter!("pw_delivery_failures_total", "kind" => "rejected").increment(1);
                    return Err(MonitorError::DeliveryRejected {
                        post_id: post.post.id.clone(),
                        status,
                        body,
                    });
                }
                Attempt::Retry { reason, wait_hint } => {
                    if attempt >= self.max_attempts {
                        counter!("pw_delivery_failures_total", "kind" => "unavailable").increment(1);
                        return Err(MonitorError::DeliveryUnavailable {
                            post_id: post.post.id.clone(),
                            attempts: attempt,
                            reason,
                        });
                    }
                    let wait = wait_hint
                        .map(|w| w.min(self.max_backoff))
                        .unwrap_or_else(|| self.backoff_for(attempt));
                    warn!(
                        target: "deliver",
                        post_id = %post.post.id,
                        attempt,
                        max_attempts = self.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        %reason,
                        "delivery failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn retry_after(rsp: &reqwest::Response) -> Option<Duration> {
    let secs: u64 = rsp
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    debug!(target: "deliver", secs, "backend sent Retry-After");
    Some(Duration::from_secs(secs))
}
