//! Bounded rendered-page fetching.
//!
//! A semaphore caps concurrent pages at the configured pool size; the
//! permit is scoped to a single fetch. Transient failures retry with
//! exponential backoff plus jitter; a page that keeps failing yields an
//! empty result so one dead link never aborts the whole mail.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use pagerender_client::PageRenderClient;

const FETCH_MAX_ATTEMPTS: u32 = 3;
const FETCH_RETRY_BASE: Duration = Duration::from_secs(2);

/// Page-fetch capability consumed by the extractor. Mocked in tests.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Rendered HTML for the URL, or an empty string after exhausted
    /// retries.
    async fn fetch(&self, url: &str) -> Result<String>;
}

pub struct BrowserPool {
    client: PageRenderClient,
    semaphore: Semaphore,
}

impl BrowserPool {
    pub fn new(render_url: &str, token: Option<&str>, timeout: Duration, max_pages: usize) -> Self {
        info!(max_pages, "Browser pool initialized");
        Self {
            client: PageRenderClient::new(render_url, token, timeout),
            semaphore: Semaphore::new(max_pages.max(1)),
        }
    }
}

#[async_trait]
impl PageFetcher for BrowserPool {
    async fn fetch(&self, url: &str) -> Result<String> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("browser pool closed"))?;

        for attempt in 0..FETCH_MAX_ATTEMPTS {
            match self.client.content(url).await {
                Ok(html) => {
                    if html.is_empty() {
                        warn!(url, "Empty rendered page");
                    } else {
                        info!(url, bytes = html.len(), "Fetched rendered page");
                    }
                    return Ok(html);
                }
                Err(e) if e.is_retryable() && attempt + 1 < FETCH_MAX_ATTEMPTS => {
                    let backoff = FETCH_RETRY_BASE * 2u32.pow(attempt);
                    let jitter = Duration::from_millis(rand::rng().random_range(0..500));
                    warn!(url, attempt = attempt + 1, error = %e, "Page fetch failed, retrying");
                    tokio::time::sleep(backoff + jitter).await;
                }
                Err(e) => {
                    warn!(url, error = %e, "Page fetch failed permanently");
                    return Ok(String::new());
                }
            }
        }

        Ok(String::new())
    }
}
