pub mod auth;
pub mod routes;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::Request;
use axum::ServiceExt;
use tower::Layer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::normalize_path::NormalizePathLayer;
use tracing::info;

use corral::config::GatewayConfig;
use corral::generator::CandleGenerator;
use corral::models::ModelManager;
use corral::scheduler::Scheduler;
use corral::tokens::TokenStore;

use state::AppState;

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub config: PathBuf,
    pub host: String,
    pub port: u16,
    pub require_token: bool,
}

pub async fn run(options: ServeOptions) -> anyhow::Result<()> {
    let config = GatewayConfig::load(&options.config)?;
    info!(models = config.models.len(), "configuration loaded");

    // Tokens live next to the config file.
    let token_path = options
        .config
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join("tokens.json");
    let tokens = TokenStore::load(&token_path);

    let generator = Arc::new(CandleGenerator::new()?);
    let models = Arc::new(ModelManager::new(generator, config).await);
    let scheduler = Scheduler::new(models.clone());

    let state = Arc::new(AppState {
        models: models.clone(),
        scheduler,
        tokens,
        require_token: options.require_token,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = routes::configure(state).layer(cors);
    let app = NormalizePathLayer::trim_trailing_slash().layer(app);

    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", options.host, options.port)).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, ServiceExt::<Request>::into_make_service(app))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    models.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
