//! Alert dispatch to chat webhooks.
//!
//! Fired only for first-of-event items and severity escalations. The
//! payload carries a signed feedback URL; its queue row is created first
//! so a user click can be correlated back to this alert.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use medsignal_common::config::FeedbackConfig;
use medsignal_common::{Article, Verdict};
use medsignal_store::Store;

use crate::aggregate::AggregateOutcome;
use crate::extract::truncate_with_ellipsis;
use crate::feedback::sign_feedback_link;

const NOTIFY_MAX_ATTEMPTS: u32 = 3;
const NOTIFY_RETRY_BASE: Duration = Duration::from_secs(2);
const BODY_PREVIEW_BYTES: usize = 500;

/// Webhook POST capability. Mocked in tests.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(&self, url: &str, payload: &serde_json::Value) -> Result<()>;
}

pub struct HttpWebhookSender {
    http: reqwest::Client,
}

impl HttpWebhookSender {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }
}

impl Default for HttpWebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(&self, url: &str, payload: &serde_json::Value) -> Result<()> {
        let resp = self.http.post(url).json(payload).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("webhook returned {status}: {body}");
        }
        Ok(())
    }
}

pub struct Notifier {
    webhooks: Vec<String>,
    feedback: FeedbackConfig,
    sender: Arc<dyn WebhookSender>,
}

impl Notifier {
    pub fn new(
        webhooks: Vec<String>,
        feedback: FeedbackConfig,
        sender: Arc<dyn WebhookSender>,
    ) -> Self {
        Self {
            webhooks,
            feedback,
            sender,
        }
    }

    /// Queue a feedback reminder, build the payload, and fan out to every
    /// configured webhook. Transport failures are retried and then logged;
    /// they never block the pipeline.
    pub async fn notify(
        &self,
        store: &dyn Store,
        verdict: &Verdict,
        article: &Article,
        outcome: &AggregateOutcome,
    ) -> Result<()> {
        if self.webhooks.is_empty() {
            return Ok(());
        }

        let queue_id = store.enqueue_feedback("@all", &outcome.sentiment_id).await?;
        let feedback_url = self.build_feedback_url(queue_id, &outcome.sentiment_id);

        let payload = json!({
            "title": verdict.title,
            "hospital": article.hospital,
            "severity": verdict.severity.as_str(),
            "source": article.source,
            "body": truncate_with_ellipsis(&article.body, BODY_PREVIEW_BYTES),
            "reason": verdict.reason,
            "url": article.url,
            "event_total": outcome.event_total,
            "feedback_url": feedback_url,
        });

        for webhook in &self.webhooks {
            self.deliver(webhook, &payload).await;
        }
        Ok(())
    }

    async fn deliver(&self, webhook: &str, payload: &serde_json::Value) {
        for attempt in 0..NOTIFY_MAX_ATTEMPTS {
            match self.sender.send(webhook, payload).await {
                Ok(()) => {
                    info!(webhook, "Alert delivered");
                    return;
                }
                Err(e) if attempt + 1 < NOTIFY_MAX_ATTEMPTS => {
                    warn!(webhook, attempt = attempt + 1, error = %e, "Webhook failed, retrying");
                    tokio::time::sleep(NOTIFY_RETRY_BASE * 2u32.pow(attempt)).await;
                }
                Err(e) => {
                    warn!(webhook, error = %e, "Webhook failed permanently, alert dropped");
                }
            }
        }
    }

    fn build_feedback_url(&self, queue_id: i64, sentiment_id: &str) -> Option<String> {
        if self.feedback.link_base_url.is_empty() || self.feedback.link_secret.is_empty() {
            return None;
        }
        let expiry = (Utc::now() + chrono::Duration::hours(self.feedback.link_ttl_hours)).timestamp();
        let sig = sign_feedback_link(&self.feedback.link_secret, queue_id, sentiment_id, expiry);
        let joiner = if self.feedback.link_base_url.contains('?') {
            '&'
        } else {
            '?'
        };
        Some(format!(
            "{}{}queue_id={queue_id}&expires={expiry}&sig={sig}",
            self.feedback.link_base_url, joiner
        ))
    }
}
