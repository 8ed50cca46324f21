//! The Ollama-compatible API surface: model listings, model details, and
//! chat/generate execution with NDJSON streaming.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use corral::message::Message;
use corral::tools::ToolSpec;
use corral::wire::Wire;

use super::errors::ErrorResponse;
use super::execute_chat;
use crate::auth::authenticate;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct ChatBody {
    model: String,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    tools: Option<Vec<Value>>,
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct GenerateBody {
    model: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ShowBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

async fn tags(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let scope = match authenticate(&state, &headers) {
        Ok(scope) => scope,
        Err(rejection) => return rejection.into_response(),
    };
    let models = state.models.get_all_model_info(scope.allowed_set());
    Json(json!({"models": models})).into_response()
}

async fn ps(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let scope = match authenticate(&state, &headers) {
        Ok(scope) => scope,
        Err(rejection) => return rejection.into_response(),
    };
    let models = state.models.get_running_model_info(scope.allowed_set());
    Json(json!({"models": models})).into_response()
}

async fn show(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let scope = match authenticate(&state, &headers) {
        Ok(scope) => scope,
        Err(rejection) => return rejection.into_response(),
    };
    let body: ShowBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => return ErrorResponse::bad_request(format!("invalid request body: {e}")).into_response(),
    };
    let Some(name) = body.name.or(body.model) else {
        return ErrorResponse::bad_request("missing model name").into_response();
    };
    let Some(details) = state.models.get_model_details(&name) else {
        return ErrorResponse::not_found(format!("model \"{name}\" not found")).into_response();
    };
    if !scope.permits(&name) {
        return ErrorResponse::forbidden(format!("model \"{name}\" is not allowed for this token"))
            .into_response();
    }
    Json(details).into_response()
}

async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let scope = match authenticate(&state, &headers) {
        Ok(scope) => scope,
        Err(rejection) => return rejection.into_response(),
    };
    let body: ChatBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => return ErrorResponse::bad_request(format!("invalid request body: {e}")).into_response(),
    };
    let tools = body
        .tools
        .map(|list| list.iter().filter_map(ToolSpec::from_request_value).collect());
    execute_chat(
        &state,
        &scope,
        body.model,
        body.messages,
        tools,
        body.stream.unwrap_or(true),
        Wire::Native,
    )
    .await
}

/// `/api/generate` is `/api/chat` with the prompt wrapped into a single user
/// message.
async fn generate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let scope = match authenticate(&state, &headers) {
        Ok(scope) => scope,
        Err(rejection) => return rejection.into_response(),
    };
    let body: GenerateBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => return ErrorResponse::bad_request(format!("invalid request body: {e}")).into_response(),
    };
    execute_chat(
        &state,
        &scope,
        body.model,
        vec![Message::user(body.prompt)],
        None,
        body.stream.unwrap_or(true),
        Wire::Native,
    )
    .await
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/tags", get(tags))
        .route("/api/ps", get(ps))
        .route("/api/show", post(show))
        .route("/api/chat", post(chat))
        .route("/api/generate", post(generate))
        .with_state(state)
}
