//! Feedback ingestion and the feedback-to-rule compiler.
//!
//! A signed link encodes (queue_id, sentiment_id, expiry) in an
//! HMAC-SHA256 signature. Expiry is rejected before any DB lookup;
//! signatures are compared in constant time. A false-positive judgement
//! dismisses the sentiment and immediately harvests explicit keywords
//! from the comment; the periodic compiler additionally promotes n-grams
//! shared by enough false positives into suppression rules.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::info;

use medsignal_common::{MedSignalError, RuleAction, RuleType};
use medsignal_store::{NewFeedback, NewRule, Store};

type HmacSha256 = Hmac<Sha256>;

/// hex(HMAC-SHA256(secret, "queue_id|sentiment_id|expiry"))
pub fn sign_feedback_link(secret: &str, queue_id: i64, sentiment_id: &str, expiry: i64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(format!("{queue_id}|{sentiment_id}|{expiry}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison to prevent timing attacks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// One incoming feedback submission from the signed link.
#[derive(Debug, Clone)]
pub struct FeedbackSubmission {
    pub queue_id: i64,
    pub sig: String,
    pub expires: i64,
    /// true = confirmed negative, false = false positive.
    pub judgement: bool,
    pub feedback_type: String,
    pub text: String,
    pub user_id: String,
}

pub struct FeedbackHandler {
    secret: String,
}

impl FeedbackHandler {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
        }
    }

    /// Verify and apply one feedback submission.
    ///
    /// Expiry is checked before touching the store. The queue row supplies
    /// the sentiment id the signature covers, so a forged queue_id fails
    /// the HMAC even if the row exists.
    pub async fn on_feedback(
        &self,
        store: &dyn Store,
        submission: &FeedbackSubmission,
    ) -> Result<(), MedSignalError> {
        if self.secret.is_empty() {
            return Err(MedSignalError::BadSignature);
        }
        if Utc::now().timestamp() > submission.expires {
            return Err(MedSignalError::LinkExpired);
        }

        let queue = store
            .feedback_queue_row(submission.queue_id)
            .await
            .map_err(MedSignalError::Anyhow)?
            .ok_or(MedSignalError::BadSignature)?;

        let expected = sign_feedback_link(
            &self.secret,
            submission.queue_id,
            &queue.sentiment_id,
            submission.expires,
        );
        if !constant_time_eq(expected.as_bytes(), submission.sig.as_bytes()) {
            return Err(MedSignalError::BadSignature);
        }

        let feedback_type = if !submission.feedback_type.is_empty() {
            submission.feedback_type.clone()
        } else if submission.judgement {
            "true_positive".to_string()
        } else {
            "false_positive".to_string()
        };
        let text = if submission.text.trim().is_empty() {
            format!("web_feedback:{feedback_type}")
        } else {
            submission.text.trim().to_string()
        };

        let feedback_id = store
            .resolve_feedback(
                submission.queue_id,
                &NewFeedback {
                    sentiment_id: queue.sentiment_id.clone(),
                    judgement: submission.judgement,
                    feedback_type,
                    feedback_text: text.clone(),
                    user_id: submission.user_id.clone(),
                },
            )
            .await
            .map_err(MedSignalError::Anyhow)?;

        // Explicit keywords in a false-positive comment become rules at
        // once; the n-gram compiler handles the implicit ones later.
        if !submission.judgement {
            let rules: Vec<NewRule> = extract_rule_candidates(&text)
                .into_iter()
                .map(|pattern| NewRule {
                    pattern,
                    rule_type: RuleType::Keyword,
                    action: RuleAction::Suppress,
                    confidence: 0.9,
                    source_feedback_id: Some(feedback_id),
                })
                .collect();
            if !rules.is_empty() {
                let inserted = store
                    .insert_feedback_rules(&rules)
                    .await
                    .map_err(MedSignalError::Anyhow)?;
                info!(inserted, "Keyword rules from feedback comment");
            }
        }

        Ok(())
    }
}

/// Explicit keyword candidates from a feedback comment: a labelled
/// `关键词/关键字/排除/规则：…` tail and any quoted terms, split on common
/// separators, kept when 2..=20 chars.
pub fn extract_rule_candidates(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    let label = regex::Regex::new(r"(关键词|关键字|排除|规则)[:：]\s*(.+)").expect("valid regex");
    let quoted = regex::Regex::new(r#"[“"《](.+?)[”"》]"#).expect("valid regex");
    let separators = regex::Regex::new(r"[，,、;；\s]+").expect("valid regex");

    let mut raw_patterns = Vec::new();
    if let Some(captures) = label.captures(text) {
        raw_patterns.push(captures[2].to_string());
    }
    for captures in quoted.captures_iter(text) {
        raw_patterns.push(captures[1].to_string());
    }

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for raw in raw_patterns {
        for part in separators.split(&raw) {
            let term = part.trim();
            let len = term.chars().count();
            if (2..=20).contains(&len) && seen.insert(term.to_string()) {
                candidates.push(term.to_string());
            }
        }
    }
    candidates
}

/// Periodic compiler: promote n-grams shared by ≥ `min_support`
/// false-positive feedbacks (and absent from every confirmed-negative
/// feedback) into suppression rules. Existing identical rules are not
/// duplicated; manually-authored keywords are never touched.
pub struct RuleCompiler {
    min_support: usize,
    lookback: Duration,
}

const NGRAM_MIN: usize = 2;
const NGRAM_MAX: usize = 6;
const MAX_PROMOTIONS_PER_SWEEP: usize = 20;

impl RuleCompiler {
    pub fn new(min_support: usize) -> Self {
        Self {
            min_support: min_support.max(1),
            lookback: Duration::days(7),
        }
    }

    /// Run one sweep. Returns the number of newly promoted rules.
    pub async fn compile_rules(&self, store: &dyn Store) -> Result<usize> {
        let since = Utc::now() - self.lookback;
        let feedback = store.recent_feedback(since).await?;
        if feedback.is_empty() {
            return Ok(0);
        }

        // n-gram -> distinct false-positive feedback ids
        let mut support: HashMap<String, HashSet<i64>> = HashMap::new();
        let mut negative_grams: HashSet<String> = HashSet::new();

        for row in &feedback {
            // Grouping key is the sentiment's title + reason; the comment
            // text only feeds the explicit-keyword path at feedback time.
            let Some(sentiment) = store.find_sentiment(&row.sentiment_id).await? else {
                continue;
            };
            let text = format!("{}\n{}", sentiment.title, sentiment.reason);

            let grams = char_ngrams(&text, NGRAM_MIN, NGRAM_MAX);
            if row.judgement {
                negative_grams.extend(grams);
            } else {
                for gram in grams {
                    support.entry(gram).or_default().insert(row.id);
                }
            }
        }

        let mut qualifying: Vec<(String, usize)> = support
            .into_iter()
            .filter(|(gram, ids)| ids.len() >= self.min_support && !negative_grams.contains(gram))
            .map(|(gram, ids)| (gram, ids.len()))
            .collect();

        // Prefer the longest spans: drop any gram contained in another
        // qualifying gram with the same support.
        qualifying.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));
        let mut kept: Vec<(String, usize)> = Vec::new();
        for (gram, count) in qualifying {
            if kept
                .iter()
                .any(|(k, c)| *c == count && k.contains(gram.as_str()))
            {
                continue;
            }
            kept.push((gram, count));
        }
        kept.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        kept.truncate(MAX_PROMOTIONS_PER_SWEEP);

        let rules: Vec<NewRule> = kept
            .into_iter()
            .map(|(pattern, count)| NewRule {
                pattern,
                rule_type: RuleType::Keyword,
                action: RuleAction::Suppress,
                // +1 smoothing keeps even unanimous support below 1.0.
                confidence: count as f64 / (count as f64 + 1.0),
                source_feedback_id: None,
            })
            .collect();

        if rules.is_empty() {
            return Ok(0);
        }
        let inserted = store.insert_feedback_rules(&rules).await?;
        if inserted > 0 {
            info!(inserted, "Promoted suppression rules from feedback");
        }
        Ok(inserted)
    }
}

/// Character n-grams over CJK-or-ASCII word characters only; whitespace
/// and punctuation break the window.
fn char_ngrams(text: &str, min: usize, max: usize) -> HashSet<String> {
    let mut grams = HashSet::new();
    for segment in text.split(|c: char| !c.is_alphanumeric()) {
        let chars: Vec<char> = segment.chars().collect();
        for n in min..=max.min(chars.len()) {
            for window in chars.windows(n) {
                grams.insert(window.iter().collect());
            }
        }
    }
    grams
}
