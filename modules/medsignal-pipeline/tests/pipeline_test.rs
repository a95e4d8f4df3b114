//! End-to-end pipeline scenarios over the in-memory store with mock LLM,
//! renderer, and webhook implementations. The mail poller itself is
//! exercised only through its token dedup contract (the IMAP session is
//! not mockable); everything downstream runs through the real monitor
//! flow.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use medsignal_common::{FileConfig, RawMail};
use medsignal_pipeline::aggregate::Aggregator;
use medsignal_pipeline::classify::{Classifier, LlmClient};
use medsignal_pipeline::extract::Extractor;
use medsignal_pipeline::feedback::{
    sign_feedback_link, FeedbackHandler, FeedbackSubmission, RuleCompiler,
};
use medsignal_pipeline::fetch::PageFetcher;
use medsignal_pipeline::mail::MailPoller;
use medsignal_pipeline::monitor::{Monitor, TickStats};
use medsignal_pipeline::notify::{Notifier, WebhookSender};
use medsignal_store::{MailUpsert, MemoryStore, Store};

const SECRET: &str = "scenario-secret";

fn test_config() -> FileConfig {
    toml::from_str(&format!(
        r#"
        [email]
        imap_server = "imap.example.com"
        email_address = "watch@example.com"
        app_password = "pw"

        [email.rules]
        sender = "report@vendor.example"
        subject_pattern = "舆情"

        [ai]
        api_url = "https://llm.example/v1/chat/completions"
        api_key = "key"
        model = "test-model"

        [notification]
        webhooks = ["https://hook.example/alerts"]

        [feedback]
        link_base_url = "https://dash.example/api/feedback"
        link_secret = "{SECRET}"
        min_support = 3

        [browser]
        render_url = "http://render:3000"
        vendor_domains = ["vendor.example"]
        "#
    ))
    .expect("test config parses")
}

struct MockFetcher {
    pages: HashMap<String, String>,
}

#[async_trait]
impl PageFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        Ok(self.pages.get(url).cloned().unwrap_or_default())
    }
}

/// Scripted LLM: the first keyed substring found in the user prompt picks
/// the reply; `Err` entries simulate an outage for that item.
struct MockLlm {
    replies: Vec<(String, std::result::Result<String, String>)>,
    default: String,
    calls: AtomicUsize,
}

impl MockLlm {
    fn negative(severity: &str, reason: &str) -> String {
        format!(
            r#"{{"is_negative": true, "severity": "{severity}", "reason": "{reason}", "confidence": 0.9}}"#
        )
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn chat(&self, _system: &str, user: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for (key, reply) in &self.replies {
            if user.contains(key.as_str()) {
                return match reply {
                    Ok(text) => Ok(text.clone()),
                    Err(message) => Err(anyhow::anyhow!("{message}")),
                };
            }
        }
        Ok(self.default.clone())
    }
}

struct RecordingWebhook {
    sent: Mutex<Vec<serde_json::Value>>,
}

#[async_trait]
impl WebhookSender for RecordingWebhook {
    async fn send(&self, _url: &str, payload: &serde_json::Value) -> Result<()> {
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

struct Harness {
    monitor: Monitor,
    store: Arc<MemoryStore>,
    llm: Arc<MockLlm>,
    webhook: Arc<RecordingWebhook>,
}

fn report_page(title: &str, source: &str, body: &str) -> String {
    format!(
        r#"<html><body>
          <h1 class="article-title">{title}</h1>
          <span class="web-name">{source}</span>
          <div class="article-content">{body}</div>
        </body></html>"#
    )
}

fn harness(pages: HashMap<String, String>, llm: MockLlm) -> Harness {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(llm);
    let webhook = Arc::new(RecordingWebhook {
        sent: Mutex::new(Vec::new()),
    });

    let monitor = Monitor::new(
        config.clone(),
        store.clone(),
        MailPoller::new(config.email.clone()).unwrap(),
        Extractor::new(config.browser.vendor_domains.clone()),
        Arc::new(MockFetcher { pages }),
        Classifier::new(llm.clone()),
        Aggregator::new(
            config.aggregation.window_hours,
            config.aggregation.tracking_params.clone(),
        ),
        Notifier::new(
            config.notification.webhooks.clone(),
            config.feedback.clone(),
            webhook.clone(),
        ),
        RuleCompiler::new(config.feedback.min_support),
        Arc::new(AtomicBool::new(false)),
    );

    Harness {
        monitor,
        store,
        llm,
        webhook,
    }
}

fn mail(token: &str, body: &str) -> RawMail {
    RawMail {
        token: token.to_string(),
        subject: "XX市第一人民医院负面舆情".to_string(),
        body: body.to_string(),
        sender: "report@vendor.example".to_string(),
        received_at: Utc::now(),
        hospital: "XX市第一人民医院".to_string(),
    }
}

async fn ingest(h: &Harness, m: &RawMail) -> TickStats {
    let rules = h.store.enabled_rules().await.unwrap();
    let keywords = h.store.list_suppress_keywords().await.unwrap();
    let stats = tokio::sync::Mutex::new(TickStats::default());
    h.monitor
        .process_mail(m, &rules, &keywords, &stats)
        .await
        .unwrap();
    let out = *stats.lock().await;
    out
}

// S1: a fresh negative report produces one event, one original sentiment,
// and one alert with a signed feedback URL.
#[tokio::test]
async fn s1_fresh_negative_event() {
    let url = "https://vendor.example/r?id=abc&utm_source=x";
    let mut pages = HashMap::new();
    pages.insert(
        url.to_string(),
        report_page("病历外泄", "抖音", &"病历在网络流传。".repeat(50)),
    );
    let h = harness(
        pages,
        MockLlm {
            replies: Vec::new(),
            default: MockLlm::negative("high", "隐私泄露"),
            calls: AtomicUsize::new(0),
        },
    );

    let stats = ingest(&h, &mail("t-1", &format!(r#"<a href="{url}">详情</a>"#))).await;

    assert_eq!(stats.negatives, 1);
    assert_eq!(stats.notified, 1);

    let events = h.store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].total_count, 1);
    assert_eq!(events[0].last_severity, "high");

    let sentiments = h.store.sentiments();
    assert_eq!(sentiments.len(), 1);
    assert!(!sentiments[0].is_duplicate);
    assert_eq!(sentiments[0].severity, "high");
    assert_eq!(sentiments[0].event_id, Some(events[0].id));

    let sent = h.webhook.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["severity"], "high");
    let feedback_url = sent[0]["feedback_url"].as_str().unwrap();
    assert!(feedback_url.contains("sig="));
    assert_eq!(h.store.queue().len(), 1);
}

// S2: the same canonical URL (tracking params stripped) within the window
// folds into the existing event without a new alert.
#[tokio::test]
async fn s2_duplicate_within_window() {
    let url_a = "https://vendor.example/r?id=abc&utm_source=x";
    let url_b = "https://vendor.example/r?id=abc&spm=foo";
    let mut pages = HashMap::new();
    for url in [url_a, url_b] {
        pages.insert(
            url.to_string(),
            report_page("病历外泄", "抖音", "病历在网络流传。"),
        );
    }
    let h = harness(
        pages,
        MockLlm {
            replies: Vec::new(),
            default: MockLlm::negative("high", "隐私泄露"),
            calls: AtomicUsize::new(0),
        },
    );

    ingest(&h, &mail("t-1", &format!(r#"<a href="{url_a}">a</a>"#))).await;
    let before = h.store.events()[0].last_seen_at;
    let stats = ingest(&h, &mail("t-2", &format!(r#"<a href="{url_b}">b</a>"#))).await;

    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.notified, 0, "no dispatch when severity is unchanged");

    let events = h.store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].total_count, 2);
    assert!(events[0].last_seen_at >= before);

    let sentiments = h.store.sentiments();
    assert_eq!(sentiments.len(), 2);
    assert_eq!(sentiments.iter().filter(|s| s.is_duplicate).count(), 1);
    assert_eq!(h.webhook.sent.lock().unwrap().len(), 1);

    // Event lookups agree with the aggregated state.
    let event = h
        .store
        .find_event(events[0].id)
        .await
        .unwrap()
        .expect("event fetchable by id");
    assert_eq!(event.total_count, 2);
    let recent = h
        .store
        .recent_sentiments_for_event(event.id, 10)
        .await
        .unwrap();
    assert_eq!(recent.len(), 2);
}

// S3: a duplicate that escalates to high re-notifies.
#[tokio::test]
async fn s3_escalation_renotifies() {
    let url_a = "https://vendor.example/r?id=abc";
    let url_b = "https://vendor.example/r?id=abc&from=timeline";
    let mut pages = HashMap::new();
    pages.insert(
        url_a.to_string(),
        report_page("收费争议", "微博", "收费问题投诉。"),
    );
    pages.insert(
        url_b.to_string(),
        report_page("收费争议升级", "微博", "事件升级，媒体跟进。"),
    );
    let h = harness(
        pages,
        MockLlm {
            replies: vec![(
                "升级".to_string(),
                Ok(MockLlm::negative("high", "媒体扩散")),
            )],
            default: MockLlm::negative("medium", "收费争议"),
            calls: AtomicUsize::new(0),
        },
    );

    ingest(&h, &mail("t-1", &format!(r#"<a href="{url_a}">a</a>"#))).await;
    let stats = ingest(&h, &mail("t-2", &format!(r#"<a href="{url_b}">b</a>"#))).await;

    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.notified, 1, "escalation must dispatch");

    let events = h.store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].last_severity, "high");
    assert_eq!(events[0].total_count, 2);
    assert_eq!(h.webhook.sent.lock().unwrap().len(), 2);
    let sentiments = h.store.sentiments();
    assert!(sentiments.iter().any(|s| s.is_duplicate && s.severity == "high"));
}

// S4: false-positive feedback dismisses the sentiment, and three
// dismissals whose classified reason shares an n-gram compile into a
// suppression rule.
#[tokio::test]
async fn s4_false_positive_feedback_compiles_rule() {
    let mut pages = HashMap::new();
    let titles = ["义诊进社区", "新院区启用", "门诊时间调整"];
    for (i, title) in titles.iter().enumerate() {
        pages.insert(
            format!("https://vendor.example/r?id=fp{i}"),
            report_page(title, "公众号", "活动内容介绍。"),
        );
    }
    let h = harness(
        pages,
        MockLlm {
            replies: Vec::new(),
            default: MockLlm::negative("medium", "广告推广"),
            calls: AtomicUsize::new(0),
        },
    );

    for i in 0..3 {
        let url = format!("https://vendor.example/r?id=fp{i}");
        ingest(&h, &mail(&format!("t-{i}"), &format!(r#"<a href="{url}">x</a>"#))).await;
    }
    assert_eq!(h.store.queue().len(), 3);

    let handler = FeedbackHandler::new(SECRET);
    let expires = Utc::now().timestamp() + 3600;
    for queue in h.store.queue() {
        let sig = sign_feedback_link(SECRET, queue.id, &queue.sentiment_id, expires);
        handler
            .on_feedback(
                h.store.as_ref(),
                &FeedbackSubmission {
                    queue_id: queue.id,
                    sig,
                    expires,
                    judgement: false,
                    feedback_type: String::new(),
                    text: "误报".to_string(),
                    user_id: "web".to_string(),
                },
            )
            .await
            .unwrap();
    }

    for sentiment in h.store.sentiments() {
        assert_eq!(sentiment.status, "dismissed");
        assert!(sentiment.dismissed_at.is_some());
    }
    assert_eq!(h.store.feedback().len(), 3);

    let promoted = RuleCompiler::new(3)
        .compile_rules(h.store.as_ref())
        .await
        .unwrap();
    assert!(promoted > 0);
    assert!(h.store.rules().iter().any(|r| r.pattern == "广告推广"));
}

// S5: an enabled suppression rule short-circuits: no LLM call, no event.
#[tokio::test]
async fn s5_rule_prefilter_blocks_llm_and_event() {
    let url = "https://vendor.example/r?id=ad1";
    let mut pages = HashMap::new();
    pages.insert(
        url.to_string(),
        report_page("某医院广告推广软文", "公众号", "推广内容。"),
    );
    let h = harness(
        pages,
        MockLlm {
            replies: Vec::new(),
            default: MockLlm::negative("high", "should never be used"),
            calls: AtomicUsize::new(0),
        },
    );

    h.store
        .insert_feedback_rules(&[medsignal_store::NewRule {
            pattern: "广告推广".to_string(),
            rule_type: medsignal_common::RuleType::Keyword,
            action: medsignal_common::RuleAction::Suppress,
            confidence: 0.75,
            source_feedback_id: None,
        }])
        .await
        .unwrap();

    let stats = ingest(&h, &mail("t-1", &format!(r#"<a href="{url}">x</a>"#))).await;

    assert_eq!(stats.negatives, 0);
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0, "rule hit must not call the LLM");
    assert!(h.store.events().is_empty());
    assert!(h.webhook.sent.lock().unwrap().is_empty());
}

// S6: an LLM outage on one article is isolated; the other article in the
// same mail still classifies and aggregates.
#[tokio::test]
async fn s6_llm_outage_is_isolated() {
    let url_down = "https://vendor.example/r?id=down";
    let url_ok = "https://vendor.example/r?id=ok";
    let mut pages = HashMap::new();
    pages.insert(
        url_down.to_string(),
        report_page("无法分析的报道", "微博", "内容甲。"),
    );
    pages.insert(
        url_ok.to_string(),
        report_page("医疗纠纷报道", "微博", "内容乙。"),
    );
    let h = harness(
        pages,
        MockLlm {
            replies: vec![("无法分析".to_string(), Err("500 backend".to_string()))],
            default: MockLlm::negative("medium", "医疗纠纷"),
            calls: AtomicUsize::new(0),
        },
    );

    let body = format!(r#"<a href="{url_down}">a</a> <a href="{url_ok}">b</a>"#);
    let stats = ingest(&h, &mail("t-1", &body)).await;

    assert_eq!(stats.failures, 1);
    assert_eq!(stats.negatives, 1);

    let sentiments = h.store.sentiments();
    assert_eq!(sentiments.len(), 2);

    let failed = sentiments
        .iter()
        .find(|s| s.reason == "llm-unavailable")
        .expect("outage item persisted");
    assert_eq!(failed.event_id, None);
    assert_eq!(failed.severity, "low");

    let classified = sentiments
        .iter()
        .find(|s| s.reason == "医疗纠纷")
        .expect("healthy item classified");
    assert!(classified.event_id.is_some());
    assert_eq!(h.store.events().len(), 1);
}

// P1: re-polling the same mailbox state is a no-op at the token level.
#[tokio::test]
async fn p1_token_upsert_is_idempotent() {
    let store = MemoryStore::new();
    let first = store
        .upsert_processed_mail("1234:42", "市一医院", Utc::now())
        .await
        .unwrap();
    let second = store
        .upsert_processed_mail("1234:42", "市一医院", Utc::now())
        .await
        .unwrap();
    assert_eq!(first, MailUpsert::Inserted);
    assert_eq!(second, MailUpsert::Existed);
}

// P4: a dismissed sentiment leaves status=active listings but stays
// visible under status=all.
#[tokio::test]
async fn p4_dismissed_filtering() {
    let url = "https://vendor.example/r?id=abc";
    let mut pages = HashMap::new();
    pages.insert(url.to_string(), report_page("病历外泄", "抖音", "内容。"));
    let h = harness(
        pages,
        MockLlm {
            replies: Vec::new(),
            default: MockLlm::negative("high", "隐私泄露"),
            calls: AtomicUsize::new(0),
        },
    );
    ingest(&h, &mail("t-1", &format!(r#"<a href="{url}">x</a>"#))).await;

    let queue = &h.store.queue()[0];
    let expires = Utc::now().timestamp() + 3600;
    let sig = sign_feedback_link(SECRET, queue.id, &queue.sentiment_id, expires);
    FeedbackHandler::new(SECRET)
        .on_feedback(
            h.store.as_ref(),
            &FeedbackSubmission {
                queue_id: queue.id,
                sig,
                expires,
                judgement: false,
                feedback_type: String::new(),
                text: String::new(),
                user_id: "web".to_string(),
            },
        )
        .await
        .unwrap();

    let active = h
        .store
        .list_sentiments(&medsignal_store::SentimentFilter {
            status: Some("active".to_string()),
            limit: 50,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(active.is_empty());

    let all = h
        .store
        .list_sentiments(&medsignal_store::SentimentFilter {
            status: Some("all".to_string()),
            limit: 50,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, "dismissed");
}
