//! The access filter: bearer-token extraction, per-endpoint authentication,
//! and the strict-mode global gate.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::routes::errors::ErrorResponse;
use crate::state::AppState;

/// Pull the token out of `Authorization: Bearer <token>`; the scheme
/// compares case-insensitively.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// What a request is allowed to see.
#[derive(Debug, Clone)]
pub enum AccessScope {
    /// No filter applies.
    Unrestricted,
    /// Only these models are visible.
    Allowed(HashSet<String>),
}

impl AccessScope {
    pub fn permits(&self, model: &str) -> bool {
        match self {
            AccessScope::Unrestricted => true,
            AccessScope::Allowed(models) => models.contains(model),
        }
    }

    pub fn allowed_set(&self) -> Option<&HashSet<String>> {
        match self {
            AccessScope::Unrestricted => None,
            AccessScope::Allowed(models) => Some(models),
        }
    }
}

/// Per-endpoint authentication. Outside strict mode a missing or unknown
/// token simply means no filter; strict mode rejects both.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AccessScope, ErrorResponse> {
    match extract_bearer_token(headers) {
        None if state.require_token => Err(ErrorResponse::unauthorized("Authorization required")),
        None => Ok(AccessScope::Unrestricted),
        Some(token) => match state.tokens.get(&token) {
            Some(record) => Ok(AccessScope::Allowed(
                record.models.iter().cloned().collect(),
            )),
            None if state.require_token => Err(ErrorResponse::unauthorized("Invalid token")),
            None => Ok(AccessScope::Unrestricted),
        },
    }
}

/// Strict-mode global gate, applied before every non-preflight endpoint
/// (health and version included): the token must be valid and must grant at
/// least one configured model.
pub fn gate_decision(
    state: &AppState,
    method: &Method,
    headers: &HeaderMap,
) -> Option<ErrorResponse> {
    if !state.require_token || method == Method::OPTIONS {
        return None;
    }
    let token = extract_bearer_token(headers);
    let Some(record) = token.as_deref().and_then(|t| state.tokens.get(t)) else {
        return Some(ErrorResponse::forbidden(
            "Forbidden: valid bearer token required",
        ));
    };
    if record.models.iter().any(|model| state.models.has_model(model)) {
        None
    } else {
        Some(ErrorResponse::forbidden(
            "Forbidden: token does not grant access to any available model",
        ))
    }
}

pub async fn strict_gate(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(rejection) = gate_decision(&state, request.method(), request.headers()) {
        return rejection.into_response();
    }
    next.run(request).await
}
