/// Unified error types for the Borealis relay
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource absent; drives the missing-record creation paths
    #[error("Not found: {0}")]
    NotFound(String),

    /// Tombstoned or taken-down account; never maps to 404
    #[error("Account gone: {0}")]
    AccountGone(String),

    /// Outbound RPC against a PDS failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Referenced block absent from a fetched repo slice
    #[error("Missing block: {0}")]
    MissingBlock(String),

    /// Bad hostname, bad cursor, invalid CID
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unrecognized record collection or op kind
    #[error("Unrecognized record: {0}")]
    UnrecognizedRecord(String),

    /// Banned host
    #[error("Banned: {0}")]
    Banned(String),

    /// Job or subscription cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Internal errors (codec, broadcast, wiring)
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether this error is the distinguishable not-found signal.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RelayError::NotFound(_) | RelayError::Database(sqlx::Error::RowNotFound)
        )
    }
}

/// XRPC error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct XrpcErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert RelayError to HTTP response
impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            RelayError::NotFound(_) | RelayError::Database(sqlx::Error::RowNotFound) => {
                (StatusCode::NOT_FOUND, "NotFound", self.to_string())
            }
            RelayError::Validation(_) | RelayError::UnrecognizedRecord(_) => {
                (StatusCode::BAD_REQUEST, "InvalidRequest", self.to_string())
            }
            RelayError::Banned(_) => (StatusCode::UNAUTHORIZED, "Banned", self.to_string()),
            RelayError::Upstream(_) => {
                (StatusCode::UNAUTHORIZED, "UpstreamFailure", self.to_string())
            }
            RelayError::AccountGone(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "AccountGone",
                self.to_string(),
            ),
            RelayError::Database(_) | RelayError::Internal(_) | RelayError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "Internal server error".to_string(), // Don't leak details
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                self.to_string(),
            ),
        };

        let body = Json(XrpcErrorResponse {
            error: error_code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_signal() {
        assert!(RelayError::NotFound("actor".into()).is_not_found());
        assert!(RelayError::Database(sqlx::Error::RowNotFound).is_not_found());
        assert!(!RelayError::AccountGone("tombstoned".into()).is_not_found());
        assert!(!RelayError::Validation("bad cursor".into()).is_not_found());
    }

    #[test]
    fn test_account_gone_never_404() {
        let resp = RelayError::AccountGone("account was deleted".into()).into_response();
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
    }
}
