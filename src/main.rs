//! Gemini Relay - chat sessions with streaming transcript reconciliation
//!
//! Holds one conversation with a Gemini model, reached either directly with an
//! API key or through a deployed Apps Script proxy, and exposes it to a browser
//! front end over a small HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod conversation;
mod core;
mod providers;
mod routes;
#[cfg(test)]
mod testing;

use config::Config;
use crate::core::{BackendFactory, Reconciler};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub reconciler: Reconciler,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gemini_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::debug!(backend = ?config.backend, "Loaded configuration");

    // One HTTP client for every session, handed to the factory explicitly
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.backend.timeout_secs))
        .build()?;

    let factory = Arc::new(BackendFactory::new(config.backend.clone(), client));
    let reconciler = Reconciler::new(factory, config.backend.default_model.clone());

    if !reconciler.is_initialized() {
        tracing::warn!(
            "Chat is unavailable until configuration is fixed: {}",
            reconciler.last_error().unwrap_or_default()
        );
    }

    let state = AppState { config, reconciler };

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Gemini relay running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
