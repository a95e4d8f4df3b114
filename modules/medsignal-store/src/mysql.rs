//! MySQL-backed store. Raw SQL throughout; rows are decoded as tuples and
//! mapped into domain structs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, QueryBuilder};
use tracing::warn;

use medsignal_common::SentimentStatus;

use crate::{
    EventBump, EventRow, FeedbackRow, HospitalStat, MailUpsert, NewEvent, NewFeedback, NewRule,
    NewSentiment, QueueRow, RuleRow, SentimentFilter, SentimentRow, StatsSummary, Store,
};

pub struct MySqlStore {
    pool: MySqlPool,
}

type SentimentTuple = (
    String,                // sentiment_id
    Option<i64>,           // event_id
    Option<String>,        // hospital_name
    Option<String>,        // title
    Option<String>,        // source
    Option<String>,        // content
    Option<String>,        // reason
    String,                // severity
    Option<String>,        // url
    String,                // status
    bool,                  // is_duplicate
    Option<DateTime<Utc>>, // dismissed_at
    Option<String>,        // insight_text
    Option<DateTime<Utc>>, // insight_at
    DateTime<Utc>,         // processed_at
);

const SENTIMENT_COLUMNS: &str = "sentiment_id, event_id, hospital_name, title, source, content, \
     reason, severity, url, status, is_duplicate, dismissed_at, insight_text, insight_at, \
     processed_at";

fn row_to_sentiment(r: SentimentTuple) -> SentimentRow {
    SentimentRow {
        sentiment_id: r.0,
        event_id: r.1,
        hospital: r.2.unwrap_or_default(),
        title: r.3.unwrap_or_default(),
        source: r.4.unwrap_or_default(),
        content: r.5.unwrap_or_default(),
        reason: r.6.unwrap_or_default(),
        severity: r.7,
        url: r.8.unwrap_or_default(),
        status: r.9,
        is_duplicate: r.10,
        dismissed_at: r.11,
        insight_text: r.12,
        insight_at: r.13,
        processed_at: r.14,
    }
}

type EventTuple = (
    i64,
    String,
    u64,
    Option<String>,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
);

const EVENT_COLUMNS: &str = "id, hospital_name, fingerprint, event_url, total_count, last_title, \
     last_reason, last_source, last_severity, last_sentiment_id, created_at, last_seen_at";

fn row_to_event(r: EventTuple) -> EventRow {
    EventRow {
        id: r.0,
        hospital: r.1,
        fingerprint: r.2,
        event_url: r.3.unwrap_or_default(),
        total_count: r.4,
        last_title: r.5.unwrap_or_default(),
        last_reason: r.6.unwrap_or_default(),
        last_source: r.7.unwrap_or_default(),
        last_severity: r.8,
        last_sentiment_id: r.9.unwrap_or_default(),
        created_at: r.10,
        last_seen_at: r.11,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl MySqlStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Connect with a pool sized for the pipeline workers plus the API.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl Store for MySqlStore {
    async fn processed_mail_exists(&self, token: &str) -> Result<bool> {
        let row: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM processed_emails WHERE token = ? LIMIT 1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn upsert_processed_mail(
        &self,
        token: &str,
        hospital: &str,
        email_date: DateTime<Utc>,
    ) -> Result<MailUpsert> {
        let result = sqlx::query(
            "INSERT INTO processed_emails (token, hospital_name, email_date) VALUES (?, ?, ?)",
        )
        .bind(token)
        .bind(hospital)
        .bind(email_date)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(MailUpsert::Inserted),
            Err(e) if is_unique_violation(&e) => Ok(MailUpsert::Existed),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_open_event(
        &self,
        hospital: &str,
        fingerprint: u64,
        since: DateTime<Utc>,
    ) -> Result<Option<EventRow>> {
        let row = sqlx::query_as::<_, EventTuple>(&format!(
            "SELECT {EVENT_COLUMNS} FROM event_groups \
             WHERE hospital_name = ? AND fingerprint = ? AND last_seen_at >= ? \
             ORDER BY last_seen_at DESC LIMIT 1"
        ))
        .bind(hospital)
        .bind(fingerprint)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_event))
    }

    async fn create_event(&self, event: &NewEvent) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO event_groups \
             (hospital_name, fingerprint, event_url, total_count, last_title, last_reason, \
              last_source, last_severity, last_sentiment_id) \
             VALUES (?, ?, ?, 1, ?, ?, ?, ?, ?)",
        )
        .bind(&event.hospital)
        .bind(event.fingerprint)
        .bind(&event.event_url)
        .bind(&event.last_title)
        .bind(&event.last_reason)
        .bind(&event.last_source)
        .bind(event.last_severity.as_str())
        .bind(&event.last_sentiment_id)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_id() as i64)
    }

    async fn touch_event(&self, event_id: i64, bump: &EventBump) -> Result<()> {
        let result = sqlx::query(
            "UPDATE event_groups SET total_count = total_count + 1, last_title = ?, \
             last_reason = ?, last_source = ?, last_severity = ?, last_sentiment_id = ?, \
             last_seen_at = ? WHERE id = ?",
        )
        .bind(&bump.last_title)
        .bind(&bump.last_reason)
        .bind(&bump.last_source)
        .bind(bump.last_severity.as_str())
        .bind(&bump.last_sentiment_id)
        .bind(bump.last_seen_at)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(event_id, "touch_event matched no row");
        }
        Ok(())
    }

    async fn insert_sentiment(&self, record: &NewSentiment) -> Result<()> {
        sqlx::query(
            "INSERT INTO negative_sentiments \
             (sentiment_id, event_id, hospital_name, title, source, content, reason, severity, \
              url, is_duplicate) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.sentiment_id)
        .bind(record.event_id)
        .bind(&record.hospital)
        .bind(&record.title)
        .bind(&record.source)
        .bind(&record.content)
        .bind(&record.reason)
        .bind(record.severity.as_str())
        .bind(&record.url)
        .bind(record.is_duplicate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_sentiment_status(
        &self,
        sentiment_id: &str,
        status: SentimentStatus,
        dismissed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE negative_sentiments SET status = ?, dismissed_at = ? WHERE sentiment_id = ?",
        )
        .bind(status.as_str())
        .bind(dismissed_at)
        .bind(sentiment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enqueue_feedback(&self, user_id: &str, sentiment_id: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO feedback_queue (sentiment_id, user_id, sent_time) VALUES (?, ?, ?)",
        )
        .bind(sentiment_id)
        .bind(user_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_id() as i64)
    }

    async fn feedback_queue_row(&self, queue_id: i64) -> Result<Option<QueueRow>> {
        let row = sqlx::query_as::<_, (i64, String, Option<String>, Option<DateTime<Utc>>, String)>(
            "SELECT id, sentiment_id, user_id, sent_time, status FROM feedback_queue WHERE id = ?",
        )
        .bind(queue_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| QueueRow {
            id: r.0,
            sentiment_id: r.1,
            user_id: r.2.unwrap_or_default(),
            sent_time: r.3.unwrap_or_else(Utc::now),
            status: r.4,
        }))
    }

    async fn resolve_feedback(&self, queue_id: i64, record: &NewFeedback) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO sentiment_feedback \
             (sentiment_id, feedback_judgment, feedback_type, feedback_text, user_id, feedback_time) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.sentiment_id)
        .bind(record.judgement)
        .bind(&record.feedback_type)
        .bind(&record.feedback_text)
        .bind(&record.user_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        let feedback_id = result.last_insert_id() as i64;

        sqlx::query("UPDATE feedback_queue SET status = 'answered' WHERE id = ?")
            .bind(queue_id)
            .execute(&mut *tx)
            .await?;

        if record.judgement {
            sqlx::query(
                "UPDATE negative_sentiments SET status = 'active', dismissed_at = NULL \
                 WHERE sentiment_id = ?",
            )
            .bind(&record.sentiment_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE negative_sentiments SET status = 'dismissed', dismissed_at = ? \
                 WHERE sentiment_id = ?",
            )
            .bind(Utc::now())
            .bind(&record.sentiment_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(feedback_id)
    }

    async fn recent_feedback(&self, since: DateTime<Utc>) -> Result<Vec<FeedbackRow>> {
        let rows = sqlx::query_as::<
            _,
            (i64, String, bool, Option<String>, Option<String>, Option<String>, DateTime<Utc>),
        >(
            "SELECT id, sentiment_id, feedback_judgment, feedback_type, feedback_text, user_id, \
             created_at FROM sentiment_feedback WHERE created_at >= ? ORDER BY created_at DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| FeedbackRow {
                id: r.0,
                sentiment_id: r.1,
                judgement: r.2,
                feedback_type: r.3.unwrap_or_default(),
                feedback_text: r.4.unwrap_or_default(),
                user_id: r.5.unwrap_or_default(),
                created_at: r.6,
            })
            .collect())
    }

    async fn insert_feedback_rules(&self, rules: &[NewRule]) -> Result<usize> {
        let mut inserted = 0usize;
        for rule in rules {
            let existing: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM feedback_rules WHERE pattern = ? AND action = ?",
            )
            .bind(&rule.pattern)
            .bind(rule.action.as_str())
            .fetch_one(&self.pool)
            .await?;
            if existing > 0 {
                continue;
            }
            sqlx::query(
                "INSERT INTO feedback_rules \
                 (pattern, rule_type, action, confidence, enabled, source_feedback_id) \
                 VALUES (?, ?, ?, ?, 1, ?)",
            )
            .bind(&rule.pattern)
            .bind(rule.rule_type.as_str())
            .bind(rule.action.as_str())
            .bind(rule.confidence)
            .bind(rule.source_feedback_id)
            .execute(&self.pool)
            .await?;
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn enabled_rules(&self) -> Result<Vec<RuleRow>> {
        let rows = sqlx::query_as::<_, (i64, String, String, String, f64, bool)>(
            "SELECT id, pattern, rule_type, action, confidence, enabled FROM feedback_rules \
             WHERE enabled = 1 ORDER BY confidence DESC, created_at DESC LIMIT 200",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| RuleRow {
                id: r.0,
                pattern: r.1,
                rule_type: r.2,
                action: r.3,
                confidence: r.4,
                enabled: r.5,
            })
            .collect())
    }

    async fn list_suppress_keywords(&self) -> Result<Vec<String>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT keyword FROM suppress_keywords ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn replace_suppress_keywords(&self, keywords: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM suppress_keywords")
            .execute(&mut *tx)
            .await?;
        for keyword in keywords {
            let trimmed = keyword.trim();
            if trimmed.is_empty() {
                continue;
            }
            sqlx::query("INSERT IGNORE INTO suppress_keywords (keyword) VALUES (?)")
                .bind(trimmed)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_sentiments(&self, filter: &SentimentFilter) -> Result<Vec<SentimentRow>> {
        let mut qb: QueryBuilder<sqlx::MySql> = QueryBuilder::new(format!(
            "SELECT {SENTIMENT_COLUMNS} FROM negative_sentiments WHERE 1=1"
        ));

        match filter.status.as_deref() {
            Some("all") | None => {}
            Some(status) => {
                qb.push(" AND status = ").push_bind(status.to_string());
            }
        }
        if let Some(ref hospital) = filter.hospital {
            qb.push(" AND hospital_name = ").push_bind(hospital.clone());
        }
        if let Some(ref severity) = filter.severity {
            qb.push(" AND severity = ").push_bind(severity.clone());
        }
        if let Some(from) = filter.from {
            qb.push(" AND processed_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            qb.push(" AND processed_at <= ").push_bind(to);
        }
        qb.push(" ORDER BY processed_at DESC LIMIT ")
            .push_bind(filter.limit.clamp(1, 500))
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));

        let rows = qb
            .build_query_as::<SentimentTuple>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_sentiment).collect())
    }

    async fn find_sentiment(&self, sentiment_id: &str) -> Result<Option<SentimentRow>> {
        let row = sqlx::query_as::<_, SentimentTuple>(&format!(
            "SELECT {SENTIMENT_COLUMNS} FROM negative_sentiments WHERE sentiment_id = ? LIMIT 1"
        ))
        .bind(sentiment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_sentiment))
    }

    async fn search_sentiments(
        &self,
        query: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SentimentRow>> {
        let like = format!("%{query}%");
        let rows = sqlx::query_as::<_, SentimentTuple>(&format!(
            "SELECT {SENTIMENT_COLUMNS} FROM negative_sentiments \
             WHERE hospital_name LIKE ? OR title LIKE ? OR content LIKE ? OR reason LIKE ? \
             ORDER BY processed_at DESC LIMIT ? OFFSET ?"
        ))
        .bind(&like)
        .bind(&like)
        .bind(&like)
        .bind(&like)
        .bind(limit.clamp(1, 500))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_sentiment).collect())
    }

    async fn stats(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<StatsSummary> {
        // SUM over an empty table is NULL and MySQL widens integer SUMs to
        // DECIMAL, so every aggregate is coalesced and cast explicitly.
        let totals = sqlx::query_as::<_, (i64, i64, i64, i64, i64, f64)>(
            "SELECT \
             CAST(COALESCE(SUM(CASE WHEN status != 'dismissed' AND processed_at BETWEEN ? AND ? THEN 1 ELSE 0 END), 0) AS SIGNED), \
             CAST(COALESCE(SUM(CASE WHEN status = 'dismissed' AND dismissed_at BETWEEN ? AND ? THEN 1 ELSE 0 END), 0) AS SIGNED), \
             CAST(COALESCE(SUM(CASE WHEN severity = 'high' AND status != 'dismissed' AND processed_at BETWEEN ? AND ? THEN 1 ELSE 0 END), 0) AS SIGNED), \
             CAST(COALESCE(SUM(CASE WHEN severity = 'medium' AND status != 'dismissed' AND processed_at BETWEEN ? AND ? THEN 1 ELSE 0 END), 0) AS SIGNED), \
             CAST(COALESCE(SUM(CASE WHEN severity = 'low' AND status != 'dismissed' AND processed_at BETWEEN ? AND ? THEN 1 ELSE 0 END), 0) AS SIGNED), \
             CAST(COALESCE(SUM(CASE WHEN status != 'dismissed' AND processed_at BETWEEN ? AND ? \
                 THEN CASE severity WHEN 'high' THEN 0.92 WHEN 'medium' THEN 0.6 ELSE 0.35 END \
                 ELSE 0 END), 0) AS DOUBLE) \
             FROM negative_sentiments",
        )
        .bind(from)
        .bind(to)
        .bind(from)
        .bind(to)
        .bind(from)
        .bind(to)
        .bind(from)
        .bind(to)
        .bind(from)
        .bind(to)
        .bind(from)
        .bind(to)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or((0, 0, 0, 0, 0, 0.0));

        let active_total = totals.0;
        let avg_score = if active_total > 0 {
            (totals.5 / active_total as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };

        let sources = sqlx::query_as::<_, (String, i64)>(
            "SELECT COALESCE(NULLIF(source, ''), '未知'), COUNT(*) FROM negative_sentiments \
             WHERE status != 'dismissed' AND processed_at BETWEEN ? AND ? \
             GROUP BY COALESCE(NULLIF(source, ''), '未知') ORDER BY COUNT(*) DESC LIMIT 10",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let hospitals = sqlx::query_as::<_, (String, i64, i64, i64, i64)>(
            "SELECT COALESCE(NULLIF(hospital_name, ''), '未知'), \
             CAST(SUM(CASE WHEN severity = 'high' THEN 1 ELSE 0 END) AS SIGNED), \
             CAST(SUM(CASE WHEN severity = 'medium' THEN 1 ELSE 0 END) AS SIGNED), \
             CAST(SUM(CASE WHEN severity = 'low' THEN 1 ELSE 0 END) AS SIGNED), \
             COUNT(*) FROM negative_sentiments \
             WHERE status != 'dismissed' AND processed_at BETWEEN ? AND ? \
             GROUP BY COALESCE(NULLIF(hospital_name, ''), '未知') \
             ORDER BY COUNT(*) DESC LIMIT 10",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let hospital_list: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT COALESCE(NULLIF(hospital_name, ''), '未知') FROM negative_sentiments \
             WHERE status != 'dismissed' AND processed_at BETWEEN ? AND ? ORDER BY 1",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(StatsSummary {
            active_total,
            dismissed_total: totals.1,
            high_total: totals.2,
            medium_total: totals.3,
            low_total: totals.4,
            avg_score,
            sources,
            hospitals: hospitals
                .into_iter()
                .map(|h| HospitalStat {
                    hospital: h.0,
                    high: h.1,
                    medium: h.2,
                    low: h.3,
                    total: h.4,
                })
                .collect(),
            hospital_list,
        })
    }

    async fn trend_rows(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, String)>> {
        let rows = sqlx::query_as::<_, (DateTime<Utc>, String)>(
            "SELECT processed_at, severity FROM negative_sentiments \
             WHERE status != 'dismissed' AND processed_at BETWEEN ? AND ? \
             ORDER BY processed_at ASC",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn set_insight(&self, sentiment_id: &str, text: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE negative_sentiments SET insight_text = ?, insight_at = ? WHERE sentiment_id = ?",
        )
        .bind(text)
        .bind(at)
        .bind(sentiment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_event(&self, event_id: i64) -> Result<Option<EventRow>> {
        let row = sqlx::query_as::<_, EventTuple>(&format!(
            "SELECT {EVENT_COLUMNS} FROM event_groups WHERE id = ?"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_event))
    }

    async fn recent_sentiments_for_event(
        &self,
        event_id: i64,
        limit: i64,
    ) -> Result<Vec<SentimentRow>> {
        let rows = sqlx::query_as::<_, SentimentTuple>(&format!(
            "SELECT {SENTIMENT_COLUMNS} FROM negative_sentiments WHERE event_id = ? \
             ORDER BY processed_at DESC LIMIT ?"
        ))
        .bind(event_id)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_sentiment).collect())
    }

    async fn report_rows(
        &self,
        hospital: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        include_dismissed: bool,
    ) -> Result<Vec<SentimentRow>> {
        let mut qb: QueryBuilder<sqlx::MySql> = QueryBuilder::new(format!(
            "SELECT {SENTIMENT_COLUMNS} FROM negative_sentiments WHERE 1=1"
        ));
        if !include_dismissed {
            qb.push(" AND status != 'dismissed'");
        }
        if let Some(hospital) = hospital {
            qb.push(" AND hospital_name = ").push_bind(hospital.to_string());
        }
        if let Some(from) = from {
            qb.push(" AND processed_at >= ").push_bind(from);
        }
        if let Some(to) = to {
            qb.push(" AND processed_at <= ").push_bind(to);
        }
        qb.push(" ORDER BY processed_at DESC");

        let rows = qb
            .build_query_as::<SentimentTuple>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_sentiment).collect())
    }
}
