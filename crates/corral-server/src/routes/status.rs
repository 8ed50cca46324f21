use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

// Clients probe this exact string to detect an Ollama-compatible server.
async fn root() -> &'static str {
    "Ollama is running"
}

async fn version() -> Json<Value> {
    Json(json!({"version": env!("CARGO_PKG_VERSION")}))
}

pub fn routes() -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/version", get(version))
}
