use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use medsignal_common::FileConfig;
use medsignal_pipeline::aggregate::Aggregator;
use medsignal_pipeline::classify::{Classifier, HttpLlmClient};
use medsignal_pipeline::extract::Extractor;
use medsignal_pipeline::feedback::RuleCompiler;
use medsignal_pipeline::fetch::BrowserPool;
use medsignal_pipeline::mail::MailPoller;
use medsignal_pipeline::monitor::Monitor;
use medsignal_pipeline::notify::{HttpWebhookSender, Notifier};
use medsignal_store::{schema, MySqlStore};

/// Exit code for configuration failures, distinct from runtime errors.
const EXIT_CONFIG: i32 = 2;
/// How long in-flight work may drain after a shutdown signal.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(about = "Run the sentiment monitoring pipeline")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/medsignal.toml")]
    config: PathBuf,

    /// Initialize the database schema and exit.
    #[arg(long)]
    init_schema: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match FileConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {e}");
        std::process::exit(EXIT_CONFIG);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.runtime.log_level.clone())),
        )
        .init();

    info!("medsignal monitor starting");
    config.log_redacted();

    let database_url = match FileConfig::database_url() {
        Ok(url) => url,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    // Pool must cover mail and page workers plus headroom for feedback.
    let pool_size =
        (config.concurrency.p_mail + config.concurrency.p_url + 4) as u32;
    let store = Arc::new(
        MySqlStore::connect(&database_url, pool_size)
            .await
            .context("Failed to connect to MySQL")?,
    );

    schema::ensure_schema(store.pool())
        .await
        .context("Schema initialization failed")?;
    schema::seed_suppress_keywords(store.pool(), &config.notification.suppress_keywords)
        .await
        .context("Keyword seeding failed")?;

    if cli.init_schema {
        info!("Schema initialized, exiting");
        return Ok(());
    }

    let poller = MailPoller::new(config.email.clone())?;
    let extractor = Extractor::new(config.browser.vendor_domains.clone());
    let fetcher = Arc::new(BrowserPool::new(
        &config.browser.render_url,
        Some(&config.browser.render_token),
        Duration::from_secs(config.browser.fetch_timeout_secs),
        config.concurrency.p_url,
    ));
    let classifier = Classifier::new(Arc::new(HttpLlmClient::new(
        config.ai.clone(),
        config.concurrency.p_llm,
    )));
    let aggregator = Aggregator::new(
        config.aggregation.window_hours,
        config.aggregation.tracking_params.clone(),
    );
    let notifier = Notifier::new(
        config.notification.webhooks.clone(),
        config.feedback.clone(),
        Arc::new(HttpWebhookSender::new()),
    );
    let compiler = RuleCompiler::new(config.feedback.min_support);

    let cancelled = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = Monitor::new(
        config,
        store,
        poller,
        extractor,
        fetcher,
        classifier,
        aggregator,
        notifier,
        compiler,
        cancelled.clone(),
    );

    let handle = tokio::spawn(async move { monitor.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutdown signal received, draining");
    cancelled.store(true, Ordering::Relaxed);
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(DRAIN_DEADLINE, handle).await {
        Ok(Ok(Ok(()))) => info!("Monitor drained cleanly"),
        Ok(Ok(Err(e))) => error!(error = %e, "Monitor exited with error"),
        Ok(Err(e)) => error!(error = %e, "Monitor task panicked"),
        Err(_) => warn!("Drain deadline exceeded, abandoning in-flight work"),
    }

    Ok(())
}
