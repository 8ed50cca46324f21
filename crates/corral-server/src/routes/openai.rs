//! The OpenAI-compatible surface: `/v1/chat/completions` with SSE streaming
//! and `/v1/models`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
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
struct ChatCompletionsBody {
    model: String,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    tools: Option<Vec<Value>>,
    #[serde(default)]
    stream: Option<bool>,
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let scope = match authenticate(&state, &headers) {
        Ok(scope) => scope,
        Err(rejection) => return rejection.into_response(),
    };
    let body: ChatCompletionsBody = match serde_json::from_slice(&body) {
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
        body.stream.unwrap_or(false),
        Wire::OpenAi,
    )
    .await
}

async fn models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let scope = match authenticate(&state, &headers) {
        Ok(scope) => scope,
        Err(rejection) => return rejection.into_response(),
    };
    let created = Utc::now().timestamp();
    let data: Vec<Value> = state
        .models
        .get_all_model_info(scope.allowed_set())
        .into_iter()
        .map(|info| {
            json!({
                "id": info.name,
                "object": "model",
                "created": created,
                "owned_by": "library",
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(models))
        .with_state(state)
}
