use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;

mod error;
mod functions;
mod schema;
mod services;

const DEFAULT_BIND: &str = "127.0.0.1:8080";
const DEFAULT_EXPORT_DIR: &str = "downloads";

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dreamscene=info")),
        )
        .init();

    let gemini = services::GeminiClient::new(services::GeminiClientConfig::from_env())
        .context("failed to build Gemini client")?;
    let credentials = Arc::new(services::CredentialSignal::new());
    if !gemini.has_credential() {
        use services::CredentialPrompt;
        credentials
            .request_credential("GEMINI_API_KEY is not set")
            .await;
    }

    let store = Arc::new(services::SqliteHistoryStore::from_env());
    let pipeline = Arc::new(functions::Pipeline::new(
        Arc::new(gemini),
        store,
        credentials.clone(),
        Arc::new(services::MediaVault::new()),
    ));
    if let Err(e) = pipeline.load_history().await {
        tracing::warn!(error = %e, "history unavailable, starting with an empty view");
    }

    let export_dir = std::env::var("DREAMSCENE_EXPORT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_EXPORT_DIR));
    let state = functions::AppState {
        pipeline: pipeline.clone(),
        credentials,
        export_dir: Arc::new(export_dir),
    };

    let bind = std::env::var("DREAMSCENE_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(%bind, "dreamscene listening");

    axum::serve(listener, functions::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pipeline.wait_idle().await;
    Ok(())
}
