//! Event aggregation.
//!
//! Each negative verdict is fingerprinted over (canonical URL, normalized
//! hospital) and folded into an open event group within the aggregation
//! window. Concurrent aggregation of the same key is serialized by a keyed
//! in-process mutex held across find-or-create; the window query on
//! re-entry is the backstop for racing writers that slipped past.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::info;
use uuid::Uuid;

use medsignal_common::canonical::{canonical_url, event_fingerprint, normalize_hospital};
use medsignal_common::{Article, Severity, Verdict};
use medsignal_store::{EventBump, NewEvent, NewSentiment, Store};

/// Result of aggregating one verdict.
#[derive(Debug, Clone)]
pub struct AggregateOutcome {
    pub sentiment_id: String,
    pub event_id: i64,
    pub is_duplicate: bool,
    pub event_total: i64,
    /// True for a first-of-event item or a severity escalation; the
    /// notifier only fires for these.
    pub should_notify: bool,
}

type EventKey = (String, u64);

pub struct Aggregator {
    window: Duration,
    tracking_params: Vec<String>,
    locks: Mutex<HashMap<EventKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl Aggregator {
    pub fn new(window_hours: i64, tracking_params: Vec<String>) -> Self {
        Self {
            window: Duration::hours(window_hours),
            tracking_params,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Fold a negative verdict into its event group and persist the
    /// sentiment row. Holds the per-key lock across the find-or-create.
    pub async fn aggregate(
        &self,
        store: &dyn Store,
        verdict: &Verdict,
        article: &Article,
    ) -> Result<AggregateOutcome> {
        let canonical = canonical_url(&article.url, &self.tracking_params)
            .unwrap_or_else(|_| article.url.clone());
        let hospital = normalize_hospital(&article.hospital);
        let fingerprint = event_fingerprint(&canonical, &hospital);
        let sentiment_id = Uuid::new_v4().to_string();

        let key_lock = self.lock_for((hospital.clone(), fingerprint));
        let _guard = key_lock.lock().await;

        let since = Utc::now() - self.window;
        let existing = store.find_open_event(&hospital, fingerprint, since).await?;

        match existing {
            None => {
                let event_id = store
                    .create_event(&NewEvent {
                        hospital: hospital.clone(),
                        fingerprint,
                        event_url: canonical.clone(),
                        last_title: verdict.title.clone(),
                        last_reason: verdict.reason.clone(),
                        last_source: article.source.clone(),
                        last_severity: verdict.severity,
                        last_sentiment_id: sentiment_id.clone(),
                    })
                    .await?;

                store
                    .insert_sentiment(&new_sentiment(
                        &sentiment_id,
                        Some(event_id),
                        verdict,
                        article,
                        false,
                    ))
                    .await?;

                info!(event_id, hospital = %hospital, "New event group");
                Ok(AggregateOutcome {
                    sentiment_id,
                    event_id,
                    is_duplicate: false,
                    event_total: 1,
                    should_notify: true,
                })
            }
            Some(event) => {
                let prior_severity = Severity::parse(&event.last_severity);
                let escalated =
                    verdict.severity == Severity::High && prior_severity < Severity::High;

                store
                    .touch_event(
                        event.id,
                        &EventBump {
                            last_title: verdict.title.clone(),
                            last_reason: verdict.reason.clone(),
                            last_source: article.source.clone(),
                            last_severity: verdict.severity,
                            last_sentiment_id: sentiment_id.clone(),
                            last_seen_at: Utc::now(),
                        },
                    )
                    .await?;

                store
                    .insert_sentiment(&new_sentiment(
                        &sentiment_id,
                        Some(event.id),
                        verdict,
                        article,
                        true,
                    ))
                    .await?;

                info!(
                    event_id = event.id,
                    total = event.total_count + 1,
                    escalated,
                    "Duplicate folded into event"
                );
                Ok(AggregateOutcome {
                    sentiment_id,
                    event_id: event.id,
                    is_duplicate: true,
                    event_total: event.total_count + 1,
                    should_notify: escalated,
                })
            }
        }
    }

    /// Persist a non-negative item whose reason encodes a classification
    /// failure. No event linkage, no notification.
    pub async fn persist_unclassified(
        &self,
        store: &dyn Store,
        verdict: &Verdict,
        article: &Article,
    ) -> Result<String> {
        let sentiment_id = Uuid::new_v4().to_string();
        store
            .insert_sentiment(&new_sentiment(&sentiment_id, None, verdict, article, false))
            .await?;
        Ok(sentiment_id)
    }

    fn lock_for(&self, key: EventKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        if locks.len() > 1024 {
            // Drop entries no task currently holds.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(key).or_default().clone()
    }
}

fn new_sentiment(
    sentiment_id: &str,
    event_id: Option<i64>,
    verdict: &Verdict,
    article: &Article,
    is_duplicate: bool,
) -> NewSentiment {
    NewSentiment {
        sentiment_id: sentiment_id.to_string(),
        event_id,
        hospital: article.hospital.clone(),
        title: verdict.title.clone(),
        source: article.source.clone(),
        content: article.body.clone(),
        reason: verdict.reason.clone(),
        severity: verdict.severity,
        url: article.url.clone(),
        is_duplicate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medsignal_store::MemoryStore;

    fn article(url: &str) -> Article {
        Article {
            hospital: "市一医院".to_string(),
            source: "抖音".to_string(),
            title: "病历外泄".to_string(),
            url: url.to_string(),
            body: "内容".to_string(),
            fetch_failed: false,
        }
    }

    fn verdict(severity: Severity) -> Verdict {
        Verdict {
            is_negative: true,
            severity,
            reason: "隐私泄露".to_string(),
            title: "病历外泄".to_string(),
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn first_occurrence_creates_event_and_notifies() {
        let store = MemoryStore::new();
        let aggregator = Aggregator::new(72, Vec::new());

        let outcome = aggregator
            .aggregate(
                &store,
                &verdict(Severity::High),
                &article("https://vendor.example/r?id=abc&utm_source=x"),
            )
            .await
            .unwrap();

        assert!(!outcome.is_duplicate);
        assert!(outcome.should_notify);
        assert_eq!(outcome.event_total, 1);

        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].total_count, 1);
        assert_eq!(events[0].event_url, "https://vendor.example/r?id=abc");
        let sentiments = store.sentiments();
        assert_eq!(sentiments.len(), 1);
        assert_eq!(sentiments[0].event_id, Some(events[0].id));
        assert!(!sentiments[0].is_duplicate);
    }

    #[tokio::test]
    async fn tracking_param_variants_fold_into_one_event() {
        let store = MemoryStore::new();
        let aggregator = Aggregator::new(72, Vec::new());

        let first = aggregator
            .aggregate(
                &store,
                &verdict(Severity::Medium),
                &article("https://vendor.example/r?id=abc&utm_source=x"),
            )
            .await
            .unwrap();
        let second = aggregator
            .aggregate(
                &store,
                &verdict(Severity::Medium),
                &article("https://vendor.example/r?id=abc&spm=foo"),
            )
            .await
            .unwrap();

        assert_eq!(first.event_id, second.event_id);
        assert!(second.is_duplicate);
        assert!(!second.should_notify, "same severity must not re-notify");
        assert_eq!(second.event_total, 2);
        assert_eq!(store.events()[0].total_count, 2);
    }

    #[tokio::test]
    async fn escalation_to_high_notifies() {
        let store = MemoryStore::new();
        let aggregator = Aggregator::new(72, Vec::new());
        let url = "https://vendor.example/r?id=abc";

        aggregator
            .aggregate(&store, &verdict(Severity::Medium), &article(url))
            .await
            .unwrap();
        let escalated = aggregator
            .aggregate(&store, &verdict(Severity::High), &article(url))
            .await
            .unwrap();

        assert!(escalated.is_duplicate);
        assert!(escalated.should_notify);
        assert_eq!(store.events()[0].last_severity, "high");
    }

    #[tokio::test]
    async fn high_after_high_does_not_renotify() {
        let store = MemoryStore::new();
        let aggregator = Aggregator::new(72, Vec::new());
        let url = "https://vendor.example/r?id=abc";

        aggregator
            .aggregate(&store, &verdict(Severity::High), &article(url))
            .await
            .unwrap();
        let repeat = aggregator
            .aggregate(&store, &verdict(Severity::High), &article(url))
            .await
            .unwrap();

        assert!(!repeat.should_notify);
    }

    #[tokio::test]
    async fn different_hospitals_get_separate_events() {
        let store = MemoryStore::new();
        let aggregator = Aggregator::new(72, Vec::new());
        let url = "https://vendor.example/r?id=abc";

        let mut other = article(url);
        other.hospital = "市二医院".to_string();

        let first = aggregator
            .aggregate(&store, &verdict(Severity::Low), &article(url))
            .await
            .unwrap();
        let second = aggregator
            .aggregate(&store, &verdict(Severity::Low), &other)
            .await
            .unwrap();

        assert_ne!(first.event_id, second.event_id);
        assert_eq!(store.events().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_same_key_yields_single_event() {
        let store = Arc::new(MemoryStore::new());
        let aggregator = Arc::new(Aggregator::new(72, Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let aggregator = aggregator.clone();
            handles.push(tokio::spawn(async move {
                aggregator
                    .aggregate(
                        store.as_ref(),
                        &verdict(Severity::Medium),
                        &article("https://vendor.example/r?id=abc"),
                    )
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let events = store.events();
        assert_eq!(events.len(), 1, "exactly one event despite concurrency");
        assert_eq!(events[0].total_count, 8);
        assert_eq!(store.sentiments().len(), 8);
        let originals = store.sentiments().iter().filter(|s| !s.is_duplicate).count();
        assert_eq!(originals, 1);
    }

    #[tokio::test]
    async fn unclassified_item_has_no_event_linkage() {
        let store = MemoryStore::new();
        let aggregator = Aggregator::new(72, Vec::new());
        let v = Verdict {
            is_negative: false,
            severity: Severity::Low,
            reason: "parse-error".to_string(),
            title: String::new(),
            confidence: 0.0,
        };

        aggregator
            .persist_unclassified(&store, &v, &article("https://vendor.example/r?id=zz"))
            .await
            .unwrap();

        assert!(store.events().is_empty());
        let rows = store.sentiments();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_id, None);
        assert_eq!(rows[0].reason, "parse-error");
    }
}
