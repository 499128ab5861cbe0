//! Error handling at the HTTP boundary.
//!
//! Core errors carry a stable kind; this module maps kinds onto status codes
//! and user-facing messages. Anything that falls through as internal is
//! assigned a correlation uuid that appears both in the response body and in
//! the daemon log, so a report from a user can be matched to a stack trace.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use roost_core::{ErrorKind, RoostError};
use thiserror::Error;
use uuid::Uuid;

use crate::payload::ErrorResponse;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Result type alias for API handlers.
pub type ServerResult<T> = std::result::Result<T, ApiError>;

/// Errors surfaced by the HTTP layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// An error bubbled up from the core engine.
    #[error(transparent)]
    Core(#[from] RoostError),

    /// The request payload failed validation.
    #[error("{0}")]
    Validation(String),

    /// The request carried no usable credentials.
    #[error("the request is missing credentials")]
    Unauthorized,

    /// The request carried credentials that do not match this node.
    #[error("the credentials provided were not valid for this node")]
    Forbidden,

    /// The addressed entity does not exist on this node.
    #[error("{0} was not found on this node")]
    NotFound(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ApiError {
    /// A 404 for a missing server.
    pub fn server_not_found(uuid: &Uuid) -> Self {
        ApiError::NotFound(format!("server {}", uuid))
    }

    fn core_response(err: RoostError) -> Response {
        let (status, message) = match err.kind() {
            ErrorKind::PathResolution | ErrorKind::NotFound => (
                StatusCode::NOT_FOUND,
                "The requested resource was not found on the system.".to_string(),
            ),
            ErrorKind::Denylist => (
                StatusCode::FORBIDDEN,
                "This file cannot be modified: it is present in the file denylist.".to_string(),
            ),
            ErrorKind::DiskSpace => (
                StatusCode::BAD_REQUEST,
                "Cannot perform that action: not enough disk space is available.".to_string(),
            ),
            ErrorKind::IsDirectory => (
                StatusCode::BAD_REQUEST,
                "Cannot perform that action: the file is a directory.".to_string(),
            ),
            ErrorKind::NameTooLong => (
                StatusCode::BAD_REQUEST,
                "Cannot perform that action: the file name is too long.".to_string(),
            ),
            // The original product treats an unreadable archive as a caller
            // problem rather than a daemon fault.
            ErrorKind::UnknownArchive => (
                StatusCode::BAD_REQUEST,
                "The file does not appear to be a supported archive format.".to_string(),
            ),
            ErrorKind::Busy | ErrorKind::CrashTooFrequent => (StatusCode::CONFLICT, err.to_string()),
            ErrorKind::Unauthorized => (StatusCode::UNAUTHORIZED, err.to_string()),
            ErrorKind::Forbidden => (StatusCode::FORBIDDEN, err.to_string()),
            ErrorKind::Internal => return internal_response(&err),
        };

        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the 500 response for an internal error, logging it under a fresh
/// correlation uuid.
pub fn internal_response(err: &dyn std::fmt::Display) -> Response {
    let error_id = Uuid::new_v4();
    tracing::error!(error_id = %error_id, "unexpected error while handling HTTP request: {}", err);

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::with_id(
            "An unexpected error was encountered while processing this request.",
            error_id,
        )),
    )
        .into_response()
}

/// Response builder for the catch-panic layer; a panic in a handler becomes
/// an ordinary correlated 500.
pub fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = err.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = err.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "unknown panic".to_string()
    };

    internal_response(&format!("panic in request handler: {}", detail))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Core(err) => Self::core_response(err),
            ApiError::Validation(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(message))).into_response()
            }
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new(self.to_string())),
            )
                .into_response(),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                Json(ErrorResponse::new(self.to_string())),
            )
                .into_response(),
            ApiError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new(self.to_string())),
            )
                .into_response(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn status_for(err: RoostError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_kind_to_status_mapping() {
        assert_eq!(
            status_for(RoostError::PathResolution("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(RoostError::DenylistFile("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status_for(RoostError::DiskSpace), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(RoostError::IsDirectory("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(RoostError::PowerLocked), StatusCode::CONFLICT);
        assert_eq!(
            status_for(RoostError::CrashTooFrequent),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(RoostError::Unauthorized),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_for(RoostError::Suspended), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(RoostError::NotFound("server".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(RoostError::UnknownArchive),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_internal_errors_become_correlated_500s() {
        assert_eq!(
            status_for(RoostError::Configuration("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_validation_errors_are_bad_requests() {
        let response = ApiError::Validation("missing field".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
