//! The supervising loop: one tick polls the mailbox, fans out scraping,
//! classifies and aggregates in order, and dispatches alerts. Between
//! ticks the rule compiler runs on its own slower cadence. Per-mail and
//! per-article failures are isolated; a tick never aborts because one
//! item failed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

use medsignal_common::{FileConfig, RawMail};
use medsignal_store::Store;

use crate::aggregate::Aggregator;
use crate::classify::Classifier;
use crate::extract::Extractor;
use crate::feedback::RuleCompiler;
use crate::fetch::PageFetcher;
use crate::mail::MailPoller;
use crate::notify::Notifier;

pub struct Monitor {
    config: FileConfig,
    store: Arc<dyn Store>,
    poller: MailPoller,
    extractor: Extractor,
    fetcher: Arc<dyn PageFetcher>,
    classifier: Classifier,
    aggregator: Aggregator,
    notifier: Notifier,
    compiler: RuleCompiler,
    cancelled: Arc<AtomicBool>,
}

/// Per-tick counters, logged at tick end.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickStats {
    pub mails: usize,
    pub articles: usize,
    pub negatives: usize,
    pub duplicates: usize,
    pub notified: usize,
    pub failures: usize,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FileConfig,
        store: Arc<dyn Store>,
        poller: MailPoller,
        extractor: Extractor,
        fetcher: Arc<dyn PageFetcher>,
        classifier: Classifier,
        aggregator: Aggregator,
        notifier: Notifier,
        compiler: RuleCompiler,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            store,
            poller,
            extractor,
            fetcher,
            classifier,
            aggregator,
            notifier,
            compiler,
            cancelled,
        }
    }

    /// Run until the shutdown channel fires. The current tick is allowed
    /// to drain; the caller enforces the hard deadline.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let interval = Duration::from_secs(self.config.runtime.check_interval);
        let compile_every =
            Duration::from_secs(self.config.feedback.compile_interval_minutes * 60);
        let mut last_compile: Option<tokio::time::Instant> = None;

        info!(
            check_interval = self.config.runtime.check_interval,
            "Monitor loop started"
        );

        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                break;
            }

            match self.tick().await {
                Ok(stats) => info!(?stats, "Tick complete"),
                Err(e) => error!(error = %e, "Tick failed"),
            }

            if last_compile.is_none_or(|t| t.elapsed() >= compile_every) {
                match self.compiler.compile_rules(self.store.as_ref()).await {
                    Ok(n) if n > 0 => info!(promoted = n, "Rule compile sweep"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Rule compile sweep failed"),
                }
                last_compile = Some(tokio::time::Instant::now());
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Monitor loop stopped");
        Ok(())
    }

    /// One pipeline tick.
    pub async fn tick(&self) -> Result<TickStats> {
        let mails = self.poller.poll(self.store.as_ref()).await?;
        let stats = Arc::new(tokio::sync::Mutex::new(TickStats {
            mails: mails.len(),
            ..Default::default()
        }));

        if mails.is_empty() {
            let result = *stats.lock().await;
            return Ok(result);
        }

        // Rules and admin keywords are loaded once per tick; a rule
        // compiled mid-tick applies from the next tick on.
        let rules = self.store.enabled_rules().await?;
        let keywords = self.store.list_suppress_keywords().await?;

        futures::stream::iter(mails)
            .for_each_concurrent(self.config.concurrency.p_mail.max(1), |mail| {
                let rules = &rules;
                let keywords = &keywords;
                let stats = stats.clone();
                async move {
                    if let Err(e) = self.process_mail(&mail, rules, keywords, &stats).await {
                        warn!(token = %mail.token, error = %e, "Mail processing failed");
                    }
                }
            })
            .await;

        let result = *stats.lock().await;
        Ok(result)
    }

    /// Scrape, classify, and aggregate one mail. Articles are scraped
    /// concurrently but classified and aggregated in input order so the
    /// first-seen sentiment of an event is reproducible.
    pub async fn process_mail(
        &self,
        mail: &RawMail,
        rules: &[medsignal_store::RuleRow],
        keywords: &[String],
        stats: &tokio::sync::Mutex<TickStats>,
    ) -> Result<()> {
        let articles = self.extractor.extract(mail, self.fetcher.as_ref()).await;
        stats.lock().await.articles += articles.len();

        for article in &articles {
            if self.cancelled.load(Ordering::Relaxed) {
                warn!(token = %mail.token, "Cancelled mid-mail, abandoning remaining articles");
                break;
            }

            let verdict = self.classifier.classify(article, rules, keywords).await;

            if verdict.is_negative {
                match self
                    .aggregator
                    .aggregate(self.store.as_ref(), &verdict, article)
                    .await
                {
                    Ok(outcome) => {
                        let mut s = stats.lock().await;
                        s.negatives += 1;
                        if outcome.is_duplicate {
                            s.duplicates += 1;
                        }
                        drop(s);
                        if outcome.should_notify {
                            { stats.lock().await.notified += 1; }
                            if let Err(e) = self
                                .notifier
                                .notify(self.store.as_ref(), &verdict, article, &outcome)
                                .await
                            {
                                warn!(url = %article.url, error = %e, "Notify failed");
                            }
                        }
                    }
                    Err(e) => {
                        stats.lock().await.failures += 1;
                        warn!(url = %article.url, error = %e, "Aggregation failed");
                    }
                }
            } else if verdict.reason == "parse-error" || verdict.reason == "llm-unavailable" {
                // Classification failures are persisted as non-negative so
                // rescans do not silently drop them.
                { stats.lock().await.failures += 1; }
                if let Err(e) = self
                    .aggregator
                    .persist_unclassified(self.store.as_ref(), &verdict, article)
                    .await
                {
                    warn!(url = %article.url, error = %e, "Failed to persist unclassified item");
                }
            }
        }

        Ok(())
    }
}
