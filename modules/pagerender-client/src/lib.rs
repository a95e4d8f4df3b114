pub mod error;

pub use error::{PageRenderError, Result};

use std::time::Duration;

/// Client for the headless rendering service. The service loads a URL in a
/// real browser and returns the fully rendered HTML via its /content
/// endpoint.
pub struct PageRenderClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl PageRenderClient {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()).map(String::from),
        }
    }

    /// Fetch fully-rendered HTML for a URL.
    pub async fn content(&self, url: &str) -> Result<String> {
        let mut endpoint = format!("{}/content", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }

        let body = serde_json::json!({ "url": url });

        let resp = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(PageRenderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_is_dropped() {
        let client = PageRenderClient::new("http://render:3000/", Some(""), Duration::from_secs(5));
        assert!(client.token.is_none());
        assert_eq!(client.base_url, "http://render:3000");
    }

    #[test]
    fn retryable_classification() {
        assert!(PageRenderError::Network("timeout".into()).is_retryable());
        assert!(PageRenderError::Api { status: 502, message: String::new() }.is_retryable());
        assert!(!PageRenderError::Api { status: 404, message: String::new() }.is_retryable());
    }
}
