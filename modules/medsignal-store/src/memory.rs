//! In-memory store used by pipeline scenario tests. Mirrors the MySQL
//! implementation's observable behaviour, including the duplicate-token
//! upsert and the atomic feedback resolve.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use medsignal_common::{SentimentStatus, Severity};

use crate::{
    EventBump, EventRow, FeedbackRow, HospitalStat, MailUpsert, NewEvent, NewFeedback, NewRule,
    NewSentiment, QueueRow, RuleRow, SentimentFilter, SentimentRow, StatsSummary, Store,
};

#[derive(Default)]
struct Inner {
    processed_tokens: Vec<String>,
    events: Vec<EventRow>,
    sentiments: Vec<SentimentRow>,
    feedback: Vec<FeedbackRow>,
    queue: Vec<QueueRow>,
    rules: Vec<RuleRow>,
    keywords: Vec<String>,
    next_event_id: i64,
    next_feedback_id: i64,
    next_queue_id: i64,
    next_rule_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: all stored events.
    pub fn events(&self) -> Vec<EventRow> {
        self.inner.lock().unwrap().events.clone()
    }

    /// Test hook: all stored sentiments.
    pub fn sentiments(&self) -> Vec<SentimentRow> {
        self.inner.lock().unwrap().sentiments.clone()
    }

    /// Test hook: all stored feedback rows.
    pub fn feedback(&self) -> Vec<FeedbackRow> {
        self.inner.lock().unwrap().feedback.clone()
    }

    /// Test hook: all queue rows.
    pub fn queue(&self) -> Vec<QueueRow> {
        self.inner.lock().unwrap().queue.clone()
    }

    /// Test hook: all rules.
    pub fn rules(&self) -> Vec<RuleRow> {
        self.inner.lock().unwrap().rules.clone()
    }
}

fn matches_status(row: &SentimentRow, status: Option<&str>) -> bool {
    match status {
        Some("all") | None => true,
        Some(s) => row.status == s,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn processed_mail_exists(&self, token: &str) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.processed_tokens.iter().any(|t| t == token))
    }

    async fn upsert_processed_mail(
        &self,
        token: &str,
        _hospital: &str,
        _email_date: DateTime<Utc>,
    ) -> Result<MailUpsert> {
        let mut inner = self.inner.lock().unwrap();
        if inner.processed_tokens.iter().any(|t| t == token) {
            return Ok(MailUpsert::Existed);
        }
        inner.processed_tokens.push(token.to_string());
        Ok(MailUpsert::Inserted)
    }

    async fn find_open_event(
        &self,
        hospital: &str,
        fingerprint: u64,
        since: DateTime<Utc>,
    ) -> Result<Option<EventRow>> {
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<&EventRow> = inner
            .events
            .iter()
            .filter(|e| {
                e.hospital == hospital && e.fingerprint == fingerprint && e.last_seen_at >= since
            })
            .collect();
        candidates.sort_by_key(|e| std::cmp::Reverse(e.last_seen_at));
        Ok(candidates.first().map(|e| (*e).clone()))
    }

    async fn create_event(&self, event: &NewEvent) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_event_id += 1;
        let id = inner.next_event_id;
        let now = Utc::now();
        inner.events.push(EventRow {
            id,
            hospital: event.hospital.clone(),
            fingerprint: event.fingerprint,
            event_url: event.event_url.clone(),
            total_count: 1,
            last_title: event.last_title.clone(),
            last_reason: event.last_reason.clone(),
            last_source: event.last_source.clone(),
            last_severity: event.last_severity.as_str().to_string(),
            last_sentiment_id: event.last_sentiment_id.clone(),
            created_at: now,
            last_seen_at: now,
        });
        Ok(id)
    }

    async fn touch_event(&self, event_id: i64, bump: &EventBump) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(event) = inner.events.iter_mut().find(|e| e.id == event_id) {
            event.total_count += 1;
            event.last_title = bump.last_title.clone();
            event.last_reason = bump.last_reason.clone();
            event.last_source = bump.last_source.clone();
            event.last_severity = bump.last_severity.as_str().to_string();
            event.last_sentiment_id = bump.last_sentiment_id.clone();
            event.last_seen_at = bump.last_seen_at;
        }
        Ok(())
    }

    async fn insert_sentiment(&self, record: &NewSentiment) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.sentiments.push(SentimentRow {
            sentiment_id: record.sentiment_id.clone(),
            event_id: record.event_id,
            hospital: record.hospital.clone(),
            title: record.title.clone(),
            source: record.source.clone(),
            content: record.content.clone(),
            reason: record.reason.clone(),
            severity: record.severity.as_str().to_string(),
            url: record.url.clone(),
            status: "active".to_string(),
            is_duplicate: record.is_duplicate,
            dismissed_at: None,
            insight_text: None,
            insight_at: None,
            processed_at: Utc::now(),
        });
        Ok(())
    }

    async fn set_sentiment_status(
        &self,
        sentiment_id: &str,
        status: SentimentStatus,
        dismissed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for row in inner
            .sentiments
            .iter_mut()
            .filter(|s| s.sentiment_id == sentiment_id)
        {
            row.status = status.as_str().to_string();
            row.dismissed_at = dismissed_at;
        }
        Ok(())
    }

    async fn enqueue_feedback(&self, user_id: &str, sentiment_id: &str) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_queue_id += 1;
        let id = inner.next_queue_id;
        inner.queue.push(QueueRow {
            id,
            sentiment_id: sentiment_id.to_string(),
            user_id: user_id.to_string(),
            sent_time: Utc::now(),
            status: "pending".to_string(),
        });
        Ok(id)
    }

    async fn feedback_queue_row(&self, queue_id: i64) -> Result<Option<QueueRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.queue.iter().find(|q| q.id == queue_id).cloned())
    }

    async fn resolve_feedback(&self, queue_id: i64, record: &NewFeedback) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_feedback_id += 1;
        let feedback_id = inner.next_feedback_id;
        inner.feedback.push(FeedbackRow {
            id: feedback_id,
            sentiment_id: record.sentiment_id.clone(),
            judgement: record.judgement,
            feedback_type: record.feedback_type.clone(),
            feedback_text: record.feedback_text.clone(),
            user_id: record.user_id.clone(),
            created_at: Utc::now(),
        });
        if let Some(queue) = inner.queue.iter_mut().find(|q| q.id == queue_id) {
            queue.status = "answered".to_string();
        }
        let (status, dismissed_at) = if record.judgement {
            ("active", None)
        } else {
            ("dismissed", Some(Utc::now()))
        };
        let sentiment_id = record.sentiment_id.clone();
        for row in inner
            .sentiments
            .iter_mut()
            .filter(|s| s.sentiment_id == sentiment_id)
        {
            row.status = status.to_string();
            row.dismissed_at = dismissed_at;
        }
        Ok(feedback_id)
    }

    async fn recent_feedback(&self, since: DateTime<Utc>) -> Result<Vec<FeedbackRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .feedback
            .iter()
            .filter(|f| f.created_at >= since)
            .cloned()
            .collect())
    }

    async fn insert_feedback_rules(&self, rules: &[NewRule]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let mut inserted = 0;
        for rule in rules {
            let exists = inner
                .rules
                .iter()
                .any(|r| r.pattern == rule.pattern && r.action == rule.action.as_str());
            if exists {
                continue;
            }
            inner.next_rule_id += 1;
            let id = inner.next_rule_id;
            inner.rules.push(RuleRow {
                id,
                pattern: rule.pattern.clone(),
                rule_type: rule.rule_type.as_str().to_string(),
                action: rule.action.as_str().to_string(),
                confidence: rule.confidence,
                enabled: true,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn enabled_rules(&self) -> Result<Vec<RuleRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.rules.iter().filter(|r| r.enabled).cloned().collect())
    }

    async fn list_suppress_keywords(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().unwrap().keywords.clone())
    }

    async fn replace_suppress_keywords(&self, keywords: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.keywords = keywords
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        Ok(())
    }

    async fn list_sentiments(&self, filter: &SentimentFilter) -> Result<Vec<SentimentRow>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<SentimentRow> = inner
            .sentiments
            .iter()
            .filter(|s| matches_status(s, filter.status.as_deref()))
            .filter(|s| filter.hospital.as_ref().is_none_or(|h| &s.hospital == h))
            .filter(|s| filter.severity.as_ref().is_none_or(|v| &s.severity == v))
            .filter(|s| filter.from.is_none_or(|f| s.processed_at >= f))
            .filter(|s| filter.to.is_none_or(|t| s.processed_at <= t))
            .cloned()
            .collect();
        rows.sort_by_key(|s| std::cmp::Reverse(s.processed_at));
        let offset = filter.offset.max(0) as usize;
        let limit = filter.limit.clamp(1, 500) as usize;
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn find_sentiment(&self, sentiment_id: &str) -> Result<Option<SentimentRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sentiments
            .iter()
            .find(|s| s.sentiment_id == sentiment_id)
            .cloned())
    }

    async fn search_sentiments(
        &self,
        query: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SentimentRow>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<SentimentRow> = inner
            .sentiments
            .iter()
            .filter(|s| {
                s.hospital.contains(query)
                    || s.title.contains(query)
                    || s.content.contains(query)
                    || s.reason.contains(query)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|s| std::cmp::Reverse(s.processed_at));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.clamp(1, 500) as usize)
            .collect())
    }

    async fn stats(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<StatsSummary> {
        let inner = self.inner.lock().unwrap();
        let mut summary = StatsSummary::default();
        let mut score = 0.0;
        let mut sources: Vec<(String, i64)> = Vec::new();
        let mut hospitals: Vec<HospitalStat> = Vec::new();

        for row in &inner.sentiments {
            if row.status == "dismissed" {
                if row.dismissed_at.is_some_and(|d| d >= from && d <= to) {
                    summary.dismissed_total += 1;
                }
                continue;
            }
            if row.processed_at < from || row.processed_at > to {
                continue;
            }
            summary.active_total += 1;
            let severity = Severity::parse(&row.severity);
            score += severity.score();
            match severity {
                Severity::High => summary.high_total += 1,
                Severity::Medium => summary.medium_total += 1,
                Severity::Low => summary.low_total += 1,
            }
            let source = if row.source.is_empty() { "未知" } else { &row.source };
            match sources.iter_mut().find(|(s, _)| s == source) {
                Some((_, n)) => *n += 1,
                None => sources.push((source.to_string(), 1)),
            }
            let hospital = if row.hospital.is_empty() { "未知" } else { &row.hospital };
            let idx = match hospitals.iter().position(|h| h.hospital == hospital) {
                Some(idx) => idx,
                None => {
                    hospitals.push(HospitalStat {
                        hospital: hospital.to_string(),
                        ..Default::default()
                    });
                    hospitals.len() - 1
                }
            };
            let stat = &mut hospitals[idx];
            stat.total += 1;
            match severity {
                Severity::High => stat.high += 1,
                Severity::Medium => stat.medium += 1,
                Severity::Low => stat.low += 1,
            }
        }

        if summary.active_total > 0 {
            summary.avg_score =
                (score / summary.active_total as f64 * 1000.0).round() / 10.0;
        }
        sources.sort_by_key(|(_, n)| std::cmp::Reverse(*n));
        sources.truncate(10);
        hospitals.sort_by_key(|h| std::cmp::Reverse(h.total));
        summary.hospital_list = {
            let mut list: Vec<String> = hospitals.iter().map(|h| h.hospital.clone()).collect();
            list.sort();
            list
        };
        hospitals.truncate(10);
        summary.sources = sources;
        summary.hospitals = hospitals;
        Ok(summary)
    }

    async fn trend_rows(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, String)>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<(DateTime<Utc>, String)> = inner
            .sentiments
            .iter()
            .filter(|s| s.status != "dismissed" && s.processed_at >= from && s.processed_at <= to)
            .map(|s| (s.processed_at, s.severity.clone()))
            .collect();
        rows.sort_by_key(|(t, _)| *t);
        Ok(rows)
    }

    async fn set_insight(&self, sentiment_id: &str, text: &str, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for row in inner
            .sentiments
            .iter_mut()
            .filter(|s| s.sentiment_id == sentiment_id)
        {
            row.insight_text = Some(text.to_string());
            row.insight_at = Some(at);
        }
        Ok(())
    }

    async fn find_event(&self, event_id: i64) -> Result<Option<EventRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.events.iter().find(|e| e.id == event_id).cloned())
    }

    async fn recent_sentiments_for_event(
        &self,
        event_id: i64,
        limit: i64,
    ) -> Result<Vec<SentimentRow>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<SentimentRow> = inner
            .sentiments
            .iter()
            .filter(|s| s.event_id == Some(event_id))
            .cloned()
            .collect();
        rows.sort_by_key(|s| std::cmp::Reverse(s.processed_at));
        rows.truncate(limit.clamp(1, 100) as usize);
        Ok(rows)
    }

    async fn report_rows(
        &self,
        hospital: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        include_dismissed: bool,
    ) -> Result<Vec<SentimentRow>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<SentimentRow> = inner
            .sentiments
            .iter()
            .filter(|s| include_dismissed || s.status != "dismissed")
            .filter(|s| hospital.is_none_or(|h| s.hospital == h))
            .filter(|s| from.is_none_or(|f| s.processed_at >= f))
            .filter(|s| to.is_none_or(|t| s.processed_at <= t))
            .cloned()
            .collect();
        rows.sort_by_key(|s| std::cmp::Reverse(s.processed_at));
        Ok(rows)
    }
}
