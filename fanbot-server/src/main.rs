use fanbot_server::{app, config::RelayConfig, AppState};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanbot_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env()?;
    let state = AppState::new(config.clone())?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("AI relay listening on http://{}", listener.local_addr()?);
    info!("Inference server: {} | Model: {}", config.ollama_host, config.model);

    if config.warmup {
        let upstream = state.upstream.clone();
        let timeout = config.warmup_timeout;
        tokio::spawn(async move {
            upstream.warmup(timeout).await;
        });
    }

    axum::serve(listener, app(state)).await?;

    Ok(())
}
