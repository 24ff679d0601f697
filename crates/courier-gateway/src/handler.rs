//! Relay request handlers.
//!
//! Each REST request builds exactly one envelope: token injected from the
//! header, body passed through as the payload, and an operation-specific
//! timeout from the route table. The admission gate runs before relay
//! dispatch; a relay `None` (timeout, unreachable, malformed) maps
//! uniformly to 408.

use crate::server::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use courier_core::{Envelope, StateCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error};

/// Header carrying the caller's opaque auth token.
pub const TOKEN_HEADER: &str = "x-courier-token";

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Map a backend response state to an HTTP status.
pub fn status_for(state: Option<StateCode>) -> StatusCode {
    match state {
        Some(StateCode::Ok) => StatusCode::OK,
        Some(StateCode::InvalidParameter) => StatusCode::BAD_REQUEST,
        Some(StateCode::NoToken) | Some(StateCode::Unauthorized) => StatusCode::UNAUTHORIZED,
        Some(StateCode::NotFound) => StatusCode::NOT_FOUND,
        // Failure, or a response carrying no state at all.
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Relay one REST request to a backend service.
pub async fn handle_relay(
    State(state): State<Arc<AppState>>,
    Path((service, action)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let route = state.routes.route(&action);

    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    if route.require_token && token.is_none() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing token"})),
        );
    }

    // Admission gate: every call shifts the window, rejected ones included.
    if let Some(cooling) = route.cooling {
        let key = format!(
            "{}:{}",
            token.as_deref().unwrap_or("anonymous"),
            action
        );
        if !state.cooldown.admit(&key, cooling) {
            debug!("cooldown rejected '{}'", key);
            return (
                StatusCode::NOT_ACCEPTABLE,
                Json(json!({"error": "too frequent"})),
            );
        }
    }

    let mut request = Envelope::request(action.clone(), body);
    if let Some(token) = token {
        request.set_token(token);
    }

    match state
        .relay
        .transmit_sync(&service, request, route.timeout)
        .await
    {
        Some(response) => {
            let status = status_for(response.state_code());
            if !status.is_success() {
                error!(
                    "backend '{}' answered '{}' with state {:?}",
                    service,
                    action,
                    response.state_code()
                );
            }
            (status, Json(response.data))
        }
        None => (
            StatusCode::REQUEST_TIMEOUT,
            Json(json!({"error": "service did not answer"})),
        ),
    }
}
