use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use std::fmt;

/// The single error shape every handler returns: an HTTP status plus the
/// `{result, error}` envelope. Next-hop errors keep their original status
/// and tag when relayed.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiError {
    pub status: StatusCode,
    pub result: String,
    pub message: String,
}

/// Envelope as it appears on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub result: String,
    #[serde(default)]
    pub error: String,
}

impl ApiError {
    pub fn internal_server_error() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR")
    }

    pub fn bad_request() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST")
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN")
    }

    pub fn session_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "SESSION_NOT_FOUND").with_message("Session not found")
    }

    pub fn next_hop_unavailable() -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "NEXT_HOP_UNAVAILABLE").with_message("Next hop unavailable")
    }

    pub fn not_an_exit_node() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "NOT_AN_EXIT_NODE")
    }

    pub fn too_many_hops() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "TOO_MANY_HOPS")
    }

    /// Rebuilds a relayed next-hop error from its decoded envelope.
    pub fn from_next_hop(status: StatusCode, body: ErrorBody, host: &str) -> Self {
        ApiError {
            status,
            result: body.result,
            message: format!("Error from {host}: {}", body.error),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_error(self, error: impl fmt::Display) -> Self {
        self.with_message(error.to_string())
    }

    fn new(status: StatusCode, result: &str) -> Self {
        ApiError {
            status,
            result: result.to_string(),
            message: String::new(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.status.as_u16(), self.result, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            result: self.result,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_hop_error_keeps_status_and_tag() {
        let body = ErrorBody {
            result: "FORBIDDEN".to_string(),
            error: "nope".to_string(),
        };
        let err = ApiError::from_next_hop(StatusCode::FORBIDDEN, body, "hop-b:8080");

        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.result, "FORBIDDEN");
        assert!(err.message.starts_with("Error from "));
        assert!(err.message.contains("nope"));
    }

    #[test]
    fn envelope_serializes_result_and_error() {
        let err = ApiError::session_not_found();
        let body = ErrorBody {
            result: err.result.clone(),
            error: err.message.clone(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["result"], "SESSION_NOT_FOUND");
        assert_eq!(json["error"], "Session not found");
    }
}
