//! Article classification.
//!
//! Order of authority: compiled suppression rules, then the admin
//! suppress-keyword list, then the LLM. A rule hit never reaches the LLM.
//! The LLM answer must be a JSON object (prose-wrapped is tolerated via a
//! first-top-level-object scan); anything unparseable yields a
//! non-negative verdict — classification failures are never promoted to
//! negatives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use medsignal_common::config::AiConfig;
use medsignal_common::{Article, RuleAction, RuleType, Severity, Verdict};
use medsignal_store::RuleRow;

/// Chat-completion capability. Mocked in tests; the pipeline counts on a
/// rule hit never invoking this.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// reqwest-backed client for the vendor chat-completions endpoint, with an
/// in-flight cap and bounded retries on 5xx/transport failures.
pub struct HttpLlmClient {
    config: AiConfig,
    http: reqwest::Client,
    semaphore: Semaphore,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl HttpLlmClient {
    pub fn new(config: AiConfig, max_in_flight: usize) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            config,
            http,
            semaphore: Semaphore::new(max_in_flight.max(1)),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("LLM semaphore closed"))?;

        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            let result = self
                .http
                .post(&self.config.api_url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: ChatResponse =
                            resp.json().await.context("LLM response body was not JSON")?;
                        let content = parsed
                            .choices
                            .into_iter()
                            .next()
                            .map(|c| c.message.content)
                            .context("LLM response had no choices")?;
                        debug!(chars = content.len(), "LLM reply received");
                        return Ok(content);
                    }
                    if status.is_client_error() {
                        let text = resp.text().await.unwrap_or_default();
                        bail!("LLM request rejected ({status}): {text}");
                    }
                    last_err = Some(anyhow::anyhow!("LLM server error: {status}"));
                }
                Err(e) => last_err = Some(e.into()),
            }

            if attempt < self.config.max_retries {
                let backoff = Duration::from_secs(2u64.pow(attempt));
                warn!(attempt = attempt + 1, "LLM call failed, backing off");
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("LLM call failed")))
    }
}

pub struct Classifier {
    llm: Arc<dyn LlmClient>,
}

/// The inner JSON object the LLM must return.
#[derive(Debug, Deserialize)]
struct RawVerdict {
    is_negative: bool,
    severity: String,
    reason: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn classify(
        &self,
        article: &Article,
        rules: &[RuleRow],
        suppress_keywords: &[String],
    ) -> Verdict {
        let text = combined_text(article);

        // Compiled rules first: suppress short-circuits, downgrade caps.
        let mut severity_ceiling = Severity::High;
        for rule in rules {
            if !rule_matches(&text, rule) {
                continue;
            }
            match RuleAction::parse(&rule.action) {
                Some(RuleAction::Suppress) => {
                    info!(pattern = %rule.pattern, url = %article.url, "Suppression rule hit");
                    return Verdict::suppressed(
                        format!("rule:{}", rule.pattern),
                        article.title.clone(),
                    );
                }
                Some(RuleAction::Downgrade) => {
                    severity_ceiling = Severity::Low;
                }
                None => {}
            }
        }

        for keyword in suppress_keywords {
            if !keyword.is_empty() && text.contains(keyword.as_str()) {
                info!(keyword = %keyword, url = %article.url, "Admin suppress keyword hit");
                return Verdict::suppressed(format!("rule:{keyword}"), article.title.clone());
            }
        }

        let user_prompt = build_prompt(article);
        let reply = match self.llm.chat(SYSTEM_PROMPT, &user_prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(url = %article.url, error = %e, "LLM unavailable for article");
                return fallback_verdict(article, "llm-unavailable");
            }
        };

        let mut verdict = match parse_verdict(&reply, article) {
            Some(v) => v,
            None => {
                warn!(url = %article.url, "LLM reply had no parseable verdict");
                return fallback_verdict(article, "parse-error");
            }
        };

        if verdict.severity > severity_ceiling {
            verdict.severity = severity_ceiling;
        }
        if article.fetch_failed {
            // The page never rendered; whatever was classified came from
            // scraps, so halve the confidence.
            verdict.confidence = (verdict.confidence * 0.5).clamp(0.0, 1.0);
        }
        verdict
    }
}

fn fallback_verdict(article: &Article, reason: &str) -> Verdict {
    Verdict {
        is_negative: false,
        severity: Severity::Low,
        reason: reason.to_string(),
        title: article.title.clone(),
        confidence: 0.0,
    }
}

fn combined_text(article: &Article) -> String {
    format!("{}\n{}\n{}", article.title, article.body, article.source)
}

/// Keyword rules match by substring; regex rules by compiled pattern.
/// A pattern that fails to compile matches nothing.
pub fn rule_matches(text: &str, rule: &RuleRow) -> bool {
    if text.is_empty() || rule.pattern.is_empty() {
        return false;
    }
    match RuleType::parse(&rule.rule_type) {
        RuleType::Regex => match regex::Regex::new(&rule.pattern) {
            Ok(re) => re.is_match(text),
            Err(_) => false,
        },
        RuleType::Keyword => text.contains(rule.pattern.as_str()),
    }
}

const SYSTEM_PROMPT: &str = "你是一个专业的舆情分析助手。";

/// Fixed prompt template with the severity rubric. The article body is
/// already truncated upstream.
pub fn build_prompt(article: &Article) -> String {
    format!(
        "请判断以下内容是否对医院产生真正的负面影响。\n\
         \n\
         判断标准（以下情况视为负面舆情）：\n\
         1. 医疗事故、医疗纠纷\n\
         2. 服务态度差、收费不合理\n\
         3. 隐私泄露（如患者信息外泄）\n\
         4. 医护人员不当行为\n\
         5. 设备故障、管理混乱\n\
         6. 其他损害医院声誉的事件\n\
         \n\
         特别注意（以下情况不属于负面）：\n\
         - 中性医疗报道（如医院开展新技术、学术会议）\n\
         - 正面新闻（如医院成功救治患者）\n\
         - 常规的医疗科普内容\n\
         \n\
         严重程度标准：\n\
         high: 医疗事故、隐私泄露、涉法涉诉等重大声誉风险\n\
         medium: 服务投诉、收费争议等一般负面\n\
         low: 影响轻微或指向不明确\n\
         \n\
         舆情信息：\n\
         涉及医院: {hospital}\n\
         来源: {source}\n\
         标题: {title}\n\
         正文: {body}\n\
         \n\
         请返回JSON格式（只返回JSON，不要其他内容）:\n\
         {{\n\
             \"is_negative\": true/false,\n\
             \"severity\": \"high/medium/low\",\n\
             \"reason\": \"简要说明判断理由（50字以内）\",\n\
             \"confidence\": 0.0-1.0\n\
         }}",
        hospital = article.hospital,
        source = article.source,
        title = article.title,
        body = article.body,
    )
}

/// Parse and normalize the LLM reply into a Verdict.
fn parse_verdict(reply: &str, article: &Article) -> Option<Verdict> {
    let json = extract_first_json_object(reply)?;
    let raw: RawVerdict = serde_json::from_str(&json).ok()?;

    let title = raw
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| article.title.clone());

    Some(Verdict {
        is_negative: raw.is_negative,
        severity: Severity::parse(&raw.severity),
        reason: raw.reason.trim().to_string(),
        title,
        confidence: raw.confidence.unwrap_or(0.8).clamp(0.0, 1.0),
    })
}

/// Return the first balanced top-level `{...}` in the input, respecting
/// string literals and escapes. No fuzzy key inference beyond this.
pub fn extract_first_json_object(input: &str) -> Option<String> {
    let start = input.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in input[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(input[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article() -> Article {
        Article {
            hospital: "市一医院".to_string(),
            source: "抖音".to_string(),
            title: "病历外泄".to_string(),
            url: "https://vendor.example/r?id=abc".to_string(),
            body: "医院病历在网络流传".to_string(),
            fetch_failed: false,
        }
    }

    fn keyword_rule(pattern: &str, action: &str) -> RuleRow {
        RuleRow {
            id: 1,
            pattern: pattern.to_string(),
            rule_type: "keyword".to_string(),
            action: action.to_string(),
            confidence: 0.9,
            enabled: true,
        }
    }

    #[test]
    fn extracts_json_from_prose() {
        let reply = "好的，分析如下：{\"is_negative\": true, \"severity\": \"high\", \
                     \"reason\": \"隐私泄露\"} 希望有帮助。";
        let json = extract_first_json_object(reply).unwrap();
        assert!(json.starts_with('{') && json.ends_with('}'));
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["severity"], "high");
    }

    #[test]
    fn extracts_nested_object() {
        let reply = r#"{"a": {"b": 1}, "c": "x}y"}"#;
        assert_eq!(extract_first_json_object(reply).unwrap(), reply);
    }

    #[test]
    fn handles_braces_inside_strings() {
        let reply = r#"text {"reason": "包含 } 字符", "is_negative": false, "severity": "low"}"#;
        let json = extract_first_json_object(reply).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&json).is_ok());
    }

    #[test]
    fn no_object_returns_none() {
        assert!(extract_first_json_object("no json here").is_none());
    }

    #[test]
    fn parse_verdict_normalizes_severity_and_confidence() {
        let reply = r#"{"is_negative": true, "severity": "HIGH", "reason": " 隐私泄露 ", "confidence": 1.7}"#;
        let verdict = parse_verdict(reply, &article()).unwrap();
        assert_eq!(verdict.severity, Severity::High);
        assert_eq!(verdict.reason, "隐私泄露");
        assert!((verdict.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(verdict.title, "病历外泄");
    }

    #[test]
    fn unknown_severity_coerces_to_low() {
        let reply = r#"{"is_negative": true, "severity": "critical", "reason": "x"}"#;
        let verdict = parse_verdict(reply, &article()).unwrap();
        assert_eq!(verdict.severity, Severity::Low);
    }

    #[test]
    fn keyword_rule_matching() {
        let rule = keyword_rule("广告推广", "suppress");
        assert!(rule_matches("医院广告推广内容", &rule));
        assert!(!rule_matches("无关内容", &rule));
    }

    #[test]
    fn regex_rule_matching() {
        let rule = RuleRow {
            id: 1,
            pattern: "招聘|广告".to_string(),
            rule_type: "regex".to_string(),
            action: "suppress".to_string(),
            confidence: 0.8,
            enabled: true,
        };
        assert!(rule_matches("医院招聘启事", &rule));
        assert!(!rule_matches("医疗事故", &rule));
    }

    #[test]
    fn invalid_regex_matches_nothing() {
        let rule = RuleRow {
            id: 1,
            pattern: "([".to_string(),
            rule_type: "regex".to_string(),
            action: "suppress".to_string(),
            confidence: 0.8,
            enabled: true,
        };
        assert!(!rule_matches("anything", &rule));
    }

    #[test]
    fn prompt_contains_article_fields_and_rubric() {
        let prompt = build_prompt(&article());
        assert!(prompt.contains("市一医院"));
        assert!(prompt.contains("抖音"));
        assert!(prompt.contains("病历外泄"));
        assert!(prompt.contains("high"));
        assert!(prompt.contains("is_negative"));
    }

    struct FixedLlm {
        reply: String,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn suppress_rule_short_circuits_llm() {
        let llm = Arc::new(FixedLlm {
            reply: r#"{"is_negative": true, "severity": "high", "reason": "x"}"#.to_string(),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let classifier = Classifier::new(llm.clone());
        let mut a = article();
        a.title = "医院广告推广内容".to_string();
        let rules = vec![keyword_rule("广告推广", "suppress")];

        let verdict = classifier.classify(&a, &rules, &[]).await;
        assert!(!verdict.is_negative);
        assert_eq!(verdict.reason, "rule:广告推广");
        assert_eq!(llm.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn admin_keyword_short_circuits_llm() {
        let llm = Arc::new(FixedLlm {
            reply: r#"{"is_negative": true, "severity": "high", "reason": "x"}"#.to_string(),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let classifier = Classifier::new(llm.clone());
        let verdict = classifier
            .classify(&article(), &[], &["病历".to_string()])
            .await;
        assert!(!verdict.is_negative);
        assert_eq!(llm.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn downgrade_rule_caps_severity() {
        let llm = Arc::new(FixedLlm {
            reply: r#"{"is_negative": true, "severity": "high", "reason": "事故"}"#.to_string(),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let classifier = Classifier::new(llm);
        let rules = vec![keyword_rule("病历", "downgrade")];
        let verdict = classifier.classify(&article(), &rules, &[]).await;
        assert!(verdict.is_negative);
        assert_eq!(verdict.severity, Severity::Low);
    }

    #[tokio::test]
    async fn unparseable_reply_is_never_negative() {
        let llm = Arc::new(FixedLlm {
            reply: "这条是负面的，非常严重".to_string(),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let classifier = Classifier::new(llm);
        let verdict = classifier.classify(&article(), &[], &[]).await;
        assert!(!verdict.is_negative);
        assert_eq!(verdict.reason, "parse-error");
    }

    #[tokio::test]
    async fn fetch_failed_halves_confidence() {
        let llm = Arc::new(FixedLlm {
            reply: r#"{"is_negative": true, "severity": "medium", "reason": "x", "confidence": 0.9}"#
                .to_string(),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let classifier = Classifier::new(llm);
        let mut a = article();
        a.fetch_failed = true;
        let verdict = classifier.classify(&a, &[], &[]).await;
        assert!((verdict.confidence - 0.45).abs() < 1e-9);
    }
}
