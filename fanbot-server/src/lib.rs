pub mod assembler;
pub mod config;
pub mod decoder;
pub mod handlers;
pub mod relay;
pub mod upstream;

use axum::{
    routing::{get, post},
    Router,
};
use config::RelayConfig;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use upstream::UpstreamClient;

/// Immutable after startup; cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub upstream: Arc<UpstreamClient>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        let upstream = UpstreamClient::new(http, config.chat_url(), config.model.clone());
        Ok(Self {
            config: Arc::new(config),
            upstream: Arc::new(upstream),
        })
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/ai/chat", post(handlers::chat))
        .route("/api/ai/chat/stream", post(handlers::chat_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
