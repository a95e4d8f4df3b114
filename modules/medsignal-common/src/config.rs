use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::MedSignalError;

/// TOML-backed configuration loaded from disk. Secrets (mailbox app
/// password, LLM key, link secret, DB URL) can be supplied or overridden
/// via environment variables so the file stays checked-in safe.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub email: EmailConfig,
    pub ai: AiConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    pub browser: BrowserConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub imap_server: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    pub email_address: String,
    #[serde(default)]
    pub app_password: String,
    pub rules: MailRules,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailRules {
    /// Only mails from this sender are considered.
    pub sender: String,
    /// Mails whose subject does not match are skipped.
    #[serde(default = "default_subject_pattern")]
    pub subject_pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiConfig {
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Seconds between pipeline ticks.
    pub check_interval: u64,
    pub log_level: String,
    pub data_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            check_interval: 300,
            log_level: "info".to_string(),
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Aggregation window W in hours.
    pub window_hours: i64,
    /// Extra tracking query parameters stripped during URL canonicalization.
    pub tracking_params: Vec<String>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_hours: 72,
            tracking_params: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Outbound chat webhook endpoints.
    pub webhooks: Vec<String>,
    /// Manually curated suppress keywords, editable via the admin API.
    pub suppress_keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub link_base_url: String,
    pub link_secret: String,
    pub link_ttl_hours: i64,
    /// Cadence of the suppression-rule compiler, in minutes.
    pub compile_interval_minutes: u64,
    /// K: minimum false-positive feedbacks sharing an n-gram for promotion.
    pub min_support: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            link_base_url: String::new(),
            link_secret: String::new(),
            link_ttl_hours: 72,
            compile_interval_minutes: 30,
            min_support: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub p_mail: usize,
    pub p_url: usize,
    pub p_llm: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            p_mail: 2,
            p_url: 4,
            p_llm: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    /// Base URL of the headless rendering service.
    pub render_url: String,
    #[serde(default)]
    pub render_token: String,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    /// Only links on these domains are scraped from mail bodies.
    pub vendor_domains: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5003,
        }
    }
}

fn default_imap_port() -> u16 {
    993
}
fn default_subject_pattern() -> String {
    "舆情".to_string()
}
fn default_max_tokens() -> u32 {
    500
}
fn default_temperature() -> f64 {
    0.3
}
fn default_llm_timeout() -> u64 {
    30
}
fn default_llm_retries() -> u32 {
    2
}
fn default_fetch_timeout() -> u64 {
    20
}

impl FileConfig {
    /// Load and parse the TOML config file, then apply env overrides.
    pub fn load(path: &Path) -> Result<FileConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: FileConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("MEDSIGNAL_APP_PASSWORD") {
            self.email.app_password = v;
        }
        if let Ok(v) = env::var("MEDSIGNAL_AI_API_KEY") {
            self.ai.api_key = v;
        }
        if let Ok(v) = env::var("MEDSIGNAL_LINK_SECRET") {
            self.feedback.link_secret = v;
        }
        if let Ok(v) = env::var("MEDSIGNAL_RENDER_TOKEN") {
            self.browser.render_token = v;
        }
    }

    /// Validate fields the pipeline cannot run without. Called once at
    /// startup; the process must exit on error rather than start partially.
    pub fn validate(&self) -> Result<(), MedSignalError> {
        let mut missing = Vec::new();
        if self.email.imap_server.is_empty() {
            missing.push("email.imap_server");
        }
        if self.email.email_address.is_empty() {
            missing.push("email.email_address");
        }
        if self.email.app_password.is_empty() {
            missing.push("email.app_password");
        }
        if self.email.rules.sender.is_empty() {
            missing.push("email.rules.sender");
        }
        if self.ai.api_url.is_empty() {
            missing.push("ai.api_url");
        }
        if self.ai.model.is_empty() {
            missing.push("ai.model");
        }
        if self.browser.render_url.is_empty() {
            missing.push("browser.render_url");
        }
        if self.browser.vendor_domains.is_empty() {
            missing.push("browser.vendor_domains");
        }
        if !self.notification.webhooks.is_empty() && self.feedback.link_secret.is_empty() {
            missing.push("feedback.link_secret");
        }
        if !missing.is_empty() {
            return Err(MedSignalError::Config(format!(
                "missing required configuration: {}",
                missing.join(", ")
            )));
        }
        if !(0.0..=2.0).contains(&self.ai.temperature) {
            return Err(MedSignalError::Config(format!(
                "ai.temperature out of range: {}",
                self.ai.temperature
            )));
        }
        if self.aggregation.window_hours <= 0 {
            return Err(MedSignalError::Config(
                "aggregation.window_hours must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Log secret presence without leaking values.
    pub fn log_redacted(&self) {
        let secrets = [
            ("email.app_password", &self.email.app_password),
            ("ai.api_key", &self.ai.api_key),
            ("feedback.link_secret", &self.feedback.link_secret),
            ("browser.render_token", &self.browser.render_token),
        ];
        for (name, value) in secrets {
            if value.is_empty() {
                tracing::info!("{name} = (empty)");
            } else {
                tracing::info!("{name} = ({} chars)", value.len());
            }
        }
    }

    /// Database URL comes from the environment only.
    pub fn database_url() -> Result<String> {
        env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [email]
        imap_server = "imap.example.com"
        email_address = "watch@example.com"
        app_password = "pw"

        [email.rules]
        sender = "report@vendor.example"

        [ai]
        api_url = "https://llm.example/v1/chat/completions"
        api_key = "key"
        model = "glm-4-flash"

        [browser]
        render_url = "http://render:3000"
        vendor_domains = ["vendor.example"]
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: FileConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.email.imap_port, 993);
        assert_eq!(config.runtime.check_interval, 300);
        assert_eq!(config.aggregation.window_hours, 72);
        assert_eq!(config.concurrency.p_url, 4);
        assert_eq!(config.feedback.link_ttl_hours, 72);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_sender_fails_validation() {
        let mut config: FileConfig = toml::from_str(MINIMAL).unwrap();
        config.email.rules.sender.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("email.rules.sender"));
    }

    #[test]
    fn webhooks_require_link_secret() {
        let mut config: FileConfig = toml::from_str(MINIMAL).unwrap();
        config.notification.webhooks = vec!["https://hook.example".to_string()];
        assert!(config.validate().is_err());
        config.feedback.link_secret = "s".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_window_rejected() {
        let mut config: FileConfig = toml::from_str(MINIMAL).unwrap();
        config.aggregation.window_hours = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_keys_rejected() {
        let with_typo = format!("{MINIMAL}\n[emial]\nx = 1\n");
        assert!(toml::from_str::<FileConfig>(&with_typo).is_err());
    }
}
