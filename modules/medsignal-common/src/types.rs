use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity assigned to a classified article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Presentation score used by stats, trend buckets, and report writers.
    /// Must stay aligned with the dashboard badge thresholds.
    pub fn score(&self) -> f64 {
        match self {
            Severity::Low => 0.35,
            Severity::Medium => 0.60,
            Severity::High => 0.92,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    /// Lenient parse: lowercases and coerces anything unknown to Low.
    pub fn parse(raw: &str) -> Severity {
        match raw.trim().to_lowercase().as_str() {
            "high" => Severity::High,
            "medium" => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review status of a stored sentiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentStatus {
    Active,
    Dismissed,
}

impl SentimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentStatus::Active => "active",
            SentimentStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(raw: &str) -> SentimentStatus {
        if raw.trim() == "dismissed" {
            SentimentStatus::Dismissed
        } else {
            SentimentStatus::Active
        }
    }
}

/// State of an outgoing feedback reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Answered,
    Expired,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Answered => "answered",
            QueueStatus::Expired => "expired",
        }
    }
}

/// What a suppression rule does when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Suppress,
    Downgrade,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Suppress => "suppress",
            RuleAction::Downgrade => "downgrade",
        }
    }

    pub fn parse(raw: &str) -> Option<RuleAction> {
        match raw {
            "suppress" => Some(RuleAction::Suppress),
            "downgrade" => Some(RuleAction::Downgrade),
            _ => None,
        }
    }
}

/// How a suppression rule pattern is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Keyword,
    Regex,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Keyword => "keyword",
            RuleType::Regex => "regex",
        }
    }

    pub fn parse(raw: &str) -> RuleType {
        if raw == "regex" {
            RuleType::Regex
        } else {
            RuleType::Keyword
        }
    }
}

/// One fetched mailbox message, already deduplicated by token.
#[derive(Debug, Clone)]
pub struct RawMail {
    /// Stable dedup token: `{uidvalidity}:{uid}` or a SHA-1 fallback.
    pub token: String,
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    /// Hospital name parsed from the body label line or the subject.
    pub hospital: String,
}

/// One scraped vendor report, ready for classification.
#[derive(Debug, Clone)]
pub struct Article {
    pub hospital: String,
    /// Source platform label (e.g. 抖音, 微博) as shown on the report page.
    pub source: String,
    pub title: String,
    pub url: String,
    pub body: String,
    /// Set when the page fetch failed after retries; the classifier
    /// downgrades confidence for these.
    pub fetch_failed: bool,
}

/// Typed output of the classifier for one article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub is_negative: bool,
    pub severity: Severity,
    pub reason: String,
    pub title: String,
    pub confidence: f64,
}

impl Verdict {
    /// Non-negative verdict used for rule hits and parse failures.
    pub fn suppressed(reason: impl Into<String>, title: impl Into<String>) -> Verdict {
        Verdict {
            is_negative: false,
            severity: Severity::Low,
            reason: reason.into(),
            title: title.into(),
            confidence: 1.0,
        }
    }
}
