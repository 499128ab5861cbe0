//! Middleware components for the node API.
//!
//! This module handles:
//! - Static-token authentication against the node credential
//! - Request and response logging

use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::ApiError, state::AppState};

//--------------------------------------------------------------------------------------------------
// Middleware Functions
//--------------------------------------------------------------------------------------------------

/// Validates the `Authorization: Bearer <token_id>.<token>` credential the
/// panel provisioned for this node.
///
/// A missing or malformed header is a 401; a present but mismatching
/// credential is a 403.
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let expected = state.get_config().snapshot().api_token();
    if expected.len() <= 1 || provided != expected {
        return Err(ApiError::Forbidden);
    }

    Ok(next.run(req).await)
}

/// Log incoming requests and their response status.
pub async fn logging_middleware(req: Request<Body>, next: Next) -> impl IntoResponse {
    let method = req.method().clone();
    let uri = req.uri().clone();

    let response = next.run(req).await;

    tracing::info!("{} {}: {}", method, uri, response.status());

    response
}
