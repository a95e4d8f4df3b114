//! Typed storage contract for the monitoring pipeline and the API surface.
//!
//! Every write is a single transaction against MySQL. The in-memory store
//! mirrors the contract for scenario tests.

pub mod memory;
pub mod mysql;
pub mod schema;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use medsignal_common::{Severity, SentimentStatus};

pub use memory::MemoryStore;
pub use mysql::MySqlStore;

/// Outcome of the processed-mail upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailUpsert {
    Inserted,
    Existed,
}

/// Insert payload for a new event group.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub hospital: String,
    pub fingerprint: u64,
    pub event_url: String,
    pub last_title: String,
    pub last_reason: String,
    pub last_source: String,
    pub last_severity: Severity,
    pub last_sentiment_id: String,
}

/// Fields bumped on an existing event when a duplicate arrives.
#[derive(Debug, Clone)]
pub struct EventBump {
    pub last_title: String,
    pub last_reason: String,
    pub last_source: String,
    pub last_severity: Severity,
    pub last_sentiment_id: String,
    pub last_seen_at: DateTime<Utc>,
}

/// One event group row.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: i64,
    pub hospital: String,
    pub fingerprint: u64,
    pub event_url: String,
    pub total_count: i64,
    pub last_title: String,
    pub last_reason: String,
    pub last_source: String,
    pub last_severity: String,
    pub last_sentiment_id: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Insert payload for one classified sentiment.
#[derive(Debug, Clone)]
pub struct NewSentiment {
    pub sentiment_id: String,
    pub event_id: Option<i64>,
    pub hospital: String,
    pub title: String,
    pub source: String,
    pub content: String,
    pub reason: String,
    pub severity: Severity,
    pub url: String,
    pub is_duplicate: bool,
}

/// One stored sentiment row.
#[derive(Debug, Clone, Serialize)]
pub struct SentimentRow {
    pub sentiment_id: String,
    pub event_id: Option<i64>,
    pub hospital: String,
    pub title: String,
    pub source: String,
    pub content: String,
    pub reason: String,
    pub severity: String,
    pub url: String,
    pub status: String,
    pub is_duplicate: bool,
    pub dismissed_at: Option<DateTime<Utc>>,
    pub insight_text: Option<String>,
    pub insight_at: Option<DateTime<Utc>>,
    pub processed_at: DateTime<Utc>,
}

/// One immutable feedback judgement.
#[derive(Debug, Clone)]
pub struct NewFeedback {
    pub sentiment_id: String,
    pub judgement: bool,
    pub feedback_type: String,
    pub feedback_text: String,
    pub user_id: String,
}

#[derive(Debug, Clone)]
pub struct FeedbackRow {
    pub id: i64,
    pub sentiment_id: String,
    pub judgement: bool,
    pub feedback_type: String,
    pub feedback_text: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// One outgoing feedback reminder row.
#[derive(Debug, Clone)]
pub struct QueueRow {
    pub id: i64,
    pub sentiment_id: String,
    pub user_id: String,
    pub sent_time: DateTime<Utc>,
    pub status: String,
}

/// Insert payload for a compiled or extracted suppression rule.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRule {
    pub pattern: String,
    pub rule_type: medsignal_common::RuleType,
    pub action: medsignal_common::RuleAction,
    pub confidence: f64,
    pub source_feedback_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RuleRow {
    pub id: i64,
    pub pattern: String,
    pub rule_type: String,
    pub action: String,
    pub confidence: f64,
    pub enabled: bool,
}

/// Filters for the sentiment list endpoint.
#[derive(Debug, Clone, Default)]
pub struct SentimentFilter {
    /// "active", "dismissed", or "all".
    pub status: Option<String>,
    pub hospital: Option<String>,
    pub severity: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HospitalStat {
    pub hospital: String,
    pub high: i64,
    pub medium: i64,
    pub low: i64,
    pub total: i64,
}

/// Aggregate counts backing /api/stats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSummary {
    pub active_total: i64,
    pub dismissed_total: i64,
    pub high_total: i64,
    pub medium_total: i64,
    pub low_total: i64,
    /// Average severity score over active rows, as a 0..100 percentage.
    pub avg_score: f64,
    pub sources: Vec<(String, i64)>,
    pub hospitals: Vec<HospitalStat>,
    pub hospital_list: Vec<String>,
}

/// Storage contract. One transaction per write operation.
#[async_trait]
pub trait Store: Send + Sync {
    // --- ingestion ---

    /// Read-only existence check used to skip fetching already-processed
    /// mails; rows are only ever created via the upsert below.
    async fn processed_mail_exists(&self, token: &str) -> Result<bool>;

    async fn upsert_processed_mail(
        &self,
        token: &str,
        hospital: &str,
        email_date: DateTime<Utc>,
    ) -> Result<MailUpsert>;

    async fn find_open_event(
        &self,
        hospital: &str,
        fingerprint: u64,
        since: DateTime<Utc>,
    ) -> Result<Option<EventRow>>;

    async fn create_event(&self, event: &NewEvent) -> Result<i64>;

    async fn touch_event(&self, event_id: i64, bump: &EventBump) -> Result<()>;

    async fn insert_sentiment(&self, record: &NewSentiment) -> Result<()>;

    // --- feedback ---

    async fn set_sentiment_status(
        &self,
        sentiment_id: &str,
        status: SentimentStatus,
        dismissed_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn enqueue_feedback(&self, user_id: &str, sentiment_id: &str) -> Result<i64>;

    async fn feedback_queue_row(&self, queue_id: i64) -> Result<Option<QueueRow>>;

    /// Write the feedback row, mark the queue row answered, and flip the
    /// referenced sentiment's status, all in one transaction. Returns the
    /// feedback row id.
    async fn resolve_feedback(&self, queue_id: i64, record: &NewFeedback) -> Result<i64>;

    async fn recent_feedback(&self, since: DateTime<Utc>) -> Result<Vec<FeedbackRow>>;

    /// Insert rules, skipping any (pattern, action) pair that already
    /// exists. Returns the number actually inserted.
    async fn insert_feedback_rules(&self, rules: &[NewRule]) -> Result<usize>;

    async fn enabled_rules(&self) -> Result<Vec<RuleRow>>;

    // --- admin keywords ---

    async fn list_suppress_keywords(&self) -> Result<Vec<String>>;

    async fn replace_suppress_keywords(&self, keywords: &[String]) -> Result<()>;

    // --- queries ---

    async fn list_sentiments(&self, filter: &SentimentFilter) -> Result<Vec<SentimentRow>>;

    async fn find_sentiment(&self, sentiment_id: &str) -> Result<Option<SentimentRow>>;

    async fn search_sentiments(
        &self,
        query: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SentimentRow>>;

    async fn stats(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<StatsSummary>;

    /// (processed_at, severity) pairs for active rows in the range,
    /// ascending; the API buckets them into trend points.
    async fn trend_rows(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, String)>>;

    async fn set_insight(&self, sentiment_id: &str, text: &str, at: DateTime<Utc>) -> Result<()>;

    async fn find_event(&self, event_id: i64) -> Result<Option<EventRow>>;

    async fn recent_sentiments_for_event(
        &self,
        event_id: i64,
        limit: i64,
    ) -> Result<Vec<SentimentRow>>;

    /// Rows backing a generated report, newest first.
    async fn report_rows(
        &self,
        hospital: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        include_dismissed: bool,
    ) -> Result<Vec<SentimentRow>>;
}
