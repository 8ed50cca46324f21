pub mod errors;
pub mod native;
pub mod openai;
pub mod status;

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;

use corral::message::Message;
use corral::reply::ChatError;
use corral::scheduler::Work;
use corral::tools::ToolSpec;
use corral::wire::{ResponseSink, Wire};

use crate::auth::{self, AccessScope};
use crate::state::AppState;
use errors::ErrorResponse;

pub fn configure(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(status::routes())
        .merge(native::routes(state.clone()))
        .merge(openai::routes(state.clone()))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state, auth::strict_gate))
        .layer(middleware::from_fn(preflight))
}

async fn not_found() -> ErrorResponse {
    ErrorResponse::not_found("Not found")
}

/// OPTIONS never reaches a handler; the CORS layer decorates the response.
async fn preflight(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    next.run(request).await
}

/// Validate the target model, build the work closure, and hand the request
/// to the scheduler. Streaming responses return immediately with a
/// channel-backed body; non-streaming responses wait for completion.
pub(crate) async fn execute_chat(
    state: &Arc<AppState>,
    scope: &AccessScope,
    model: String,
    messages: Vec<Message>,
    tools: Option<Vec<ToolSpec>>,
    stream: bool,
    wire: Wire,
) -> Response {
    if !state.models.has_model(&model) {
        return ErrorResponse::not_found(format!("model \"{model}\" not found")).into_response();
    }
    if !scope.permits(&model) {
        return ErrorResponse::forbidden(format!(
            "model \"{model}\" is not allowed for this token"
        ))
        .into_response();
    }
    if messages.is_empty() {
        return ErrorResponse::bad_request("messages must not be empty").into_response();
    }

    let (sink, rx) = ResponseSink::channel();
    let work_sink = sink.clone();
    let work: Work = Box::new(move |record| {
        Box::pin(async move {
            corral::reply::run_chat(&record, &messages, tools, stream, wire, &work_sink)
                .await
                .map_err(anyhow::Error::new)
        })
    });
    let completion = state
        .scheduler
        .submit(model, work, sink, stream, wire)
        .await;

    if stream {
        return stream_response(rx, wire);
    }
    match completion.await {
        Ok(Ok(())) => json_response(collect(rx)),
        Ok(Err(e)) => work_error(e).into_response(),
        Err(_) => ErrorResponse::internal("request dropped before completion").into_response(),
    }
}

fn stream_response(rx: UnboundedReceiver<Bytes>, wire: Wire) -> Response {
    let content_type = match wire {
        Wire::Native => "application/x-ndjson",
        Wire::OpenAi => "text/event-stream",
    };
    let body = Body::from_stream(UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap()
}

fn json_response(body: Bytes) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap()
}

/// Drain whatever the work closure wrote; completion has already resolved,
/// so the channel holds the full body.
fn collect(mut rx: UnboundedReceiver<Bytes>) -> Bytes {
    let mut buffer = BytesMut::new();
    while let Ok(chunk) = rx.try_recv() {
        buffer.extend_from_slice(&chunk);
    }
    buffer.freeze()
}

fn work_error(error: anyhow::Error) -> ErrorResponse {
    match error.downcast_ref::<ChatError>() {
        Some(ChatError::BadRequest(message)) => ErrorResponse::bad_request(message.clone()),
        Some(ChatError::Disconnected) => ErrorResponse::internal("client disconnected"),
        _ => ErrorResponse::internal(error.to_string()),
    }
}
