use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use medsignal_common::FileConfig;
use medsignal_pipeline::classify::HttpLlmClient;
use medsignal_pipeline::feedback::FeedbackHandler;
use medsignal_store::{schema, MySqlStore};

mod error;
mod handlers;
mod state;

use handlers::{admin, ai, feedback, opinions, reports, stats};
use state::AppState;

const EXIT_CONFIG: i32 = 2;

#[derive(Parser)]
#[command(about = "Serve the sentiment dashboard API")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/medsignal.toml")]
    config: PathBuf,
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/opinions", get(opinions::list_opinions))
        .route("/api/opinions/{id}", get(opinions::get_opinion))
        .route("/api/search", get(opinions::search_opinions))
        .route("/api/stats", get(stats::get_stats))
        .route("/api/stats/trend", get(stats::get_trend))
        .route("/api/ai/summary", post(ai::ai_summary))
        .route("/api/ai/insight", post(ai::ai_insight))
        .route(
            "/api/notification/suppress_keywords",
            get(admin::get_suppress_keywords).post(admin::update_suppress_keywords),
        )
        .route("/api/report/generate", post(reports::generate_report))
        .route("/api/report/download/{filename}", get(reports::download_report))
        .route(
            "/api/feedback",
            get(feedback::submit_feedback).post(feedback::submit_feedback),
        )
        .route("/healthz", get(|| async { "ok" }))
        .layer(CorsLayer::permissive())
        .with_state(state)
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

    info!("medsignal API starting");

    let database_url = match FileConfig::database_url() {
        Ok(url) => url,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    let store = Arc::new(
        MySqlStore::connect(&database_url, 8)
            .await
            .context("Failed to connect to MySQL")?,
    );
    schema::ensure_schema(store.pool())
        .await
        .context("Schema initialization failed")?;
    schema::seed_suppress_keywords(store.pool(), &config.notification.suppress_keywords)
        .await
        .context("Keyword seeding failed")?;

    let llm = Arc::new(HttpLlmClient::new(config.ai.clone(), 2));
    let feedback_handler = FeedbackHandler::new(&config.feedback.link_secret);
    let reports_dir = config.runtime.data_dir.join("reports");

    let bind = format!("{}:{}", config.api.host, config.api.port);
    let state = Arc::new(AppState {
        store,
        llm,
        feedback: feedback_handler,
        config,
        reports_dir,
    });

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!(addr = %bind, "API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("API server failed")?;

    Ok(())
}
