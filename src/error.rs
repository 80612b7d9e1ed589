//! Panel error types with HTTP status code mapping.
//!
//! [`PanelError`] is the central error type for the panel core. Each variant
//! maps to a specific HTTP status code and structured JSON error response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 2002,
///     "message": "conflict: port 443 is already used by inbound 3",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    /// Numeric error code (see ranges on [`PanelError`]).
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Panel error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category          | HTTP Status                   |
/// |-----------|-------------------|-------------------------------|
/// | 1000–1999 | Validation        | 400 Bad Request               |
/// | 2000–2999 | State / Not Found | 404 Not Found / 409 Conflict  |
/// | 3000–3999 | Server            | 500 Internal Server Error     |
/// | 4000–4999 | Xray runtime      | 503 / 504 / 409               |
#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    /// Entity with the given key was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique constraint (email, port, short code) would be violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A settings blob could not be parsed or is inconsistent.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// An inbound uses an unknown protocol or is otherwise unusable.
    #[error("invalid inbound: {0}")]
    InvalidInbound(String),

    /// Request validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Uploaded database file was rejected.
    #[error("invalid database file: {0}")]
    InvalidDb(String),

    /// Xray or its stats API is not reachable.
    #[error("xray unavailable: {0}")]
    Unavailable(String),

    /// The Xray child process could not be spawned.
    #[error("failed to spawn xray: {0}")]
    SpawnFailed(String),

    /// `start` was called while a child is already running.
    #[error("xray is already running")]
    AlreadyRunning,

    /// `stop` was called while no child is running.
    #[error("xray is not running")]
    NotRunning,

    /// A deadline elapsed before the operation completed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// File system failure (config file, access log, database file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistence layer failure.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PanelError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::InvalidSettings(_) => 1002,
            Self::InvalidInbound(_) => 1003,
            Self::InvalidDb(_) => 1004,
            Self::NotFound(_) => 2001,
            Self::Conflict(_) => 2002,
            Self::Internal(_) => 3000,
            Self::PersistenceError(_) => 3001,
            Self::Io(_) => 3002,
            Self::Unavailable(_) => 4001,
            Self::SpawnFailed(_) => 4002,
            Self::AlreadyRunning => 4003,
            Self::NotRunning => 4004,
            Self::Timeout(_) => 4005,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidSettings(_)
            | Self::InvalidInbound(_)
            | Self::InvalidDb(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::AlreadyRunning | Self::NotRunning => StatusCode::CONFLICT,
            Self::Unavailable(_) | Self::SpawnFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::PersistenceError(_) | Self::Io(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns `true` for errors a periodic job should swallow and retry on
    /// its next tick.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_) | Self::Io(_))
    }
}

impl From<sqlx::Error> for PanelError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_string())
            }
            _ => Self::PersistenceError(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for PanelError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::PersistenceError(format!("migration failed: {err}"))
    }
}

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_409() {
        let err = PanelError::Conflict("email a@b already exists".to_string());
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.error_code(), 2002);
    }

    #[test]
    fn unavailable_is_transient() {
        assert!(PanelError::Unavailable("down".to_string()).is_transient());
        assert!(PanelError::Timeout("stats".to_string()).is_transient());
        assert!(!PanelError::NotFound("x".to_string()).is_transient());
    }

    #[test]
    fn row_not_found_becomes_not_found() {
        let err = PanelError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, PanelError::NotFound(_)));
    }
}
