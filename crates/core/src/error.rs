//! Closed error taxonomy shared by the run store, step service, sandbox
//! manager and orchestrator. Every public operation in this crate returns
//! `Result<T, OrchestratorError>` so the server's HTTP layer has exactly
//! one place to map codes to status codes.

use serde::Serialize;
use std::fmt;

/// Stable error code. Do not add variants without updating the HTTP
/// mapping in `shiioo-server`'s `ApiError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    EnvInvalid,
    DbInsertFailed,
    DbUpdateFailed,
    DbNotMigrated,
    BadGateway,
    UpstreamTimeout,
    StreamClosed,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::EnvInvalid => "env_invalid",
            ErrorCode::DbInsertFailed => "db_insert_failed",
            ErrorCode::DbUpdateFailed => "db_update_failed",
            ErrorCode::DbNotMigrated => "db_not_migrated",
            ErrorCode::BadGateway => "bad_gateway",
            ErrorCode::UpstreamTimeout => "upstream_timeout",
            ErrorCode::StreamClosed => "stream_closed",
        };
        f.write_str(s)
    }
}

/// A taxonomy error: a stable code, a user-safe message, and an optional
/// cause kept for logs but never serialized to clients.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct OrchestratorError {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub cause: Option<anyhow::Error>,
}

impl OrchestratorError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn db_insert_failed(cause: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorCode::DbInsertFailed, "Failed to persist record.").with_cause(cause)
    }

    pub fn db_update_failed(cause: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorCode::DbUpdateFailed, "Failed to update record.").with_cause(cause)
    }

    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UpstreamTimeout, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadGateway, message)
    }

    pub fn stream_closed() -> Self {
        Self::new(ErrorCode::StreamClosed, "Event stream is closed.")
    }

    pub fn env_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EnvInvalid, message)
    }

    /// HTTP status code this error maps to. Kept here (rather than only
    /// in the server crate) so SDK and server agree on the contract
    /// without duplicating the table.
    pub fn http_status(&self) -> u16 {
        match self.code {
            ErrorCode::BadRequest => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::RateLimited => 429,
            ErrorCode::EnvInvalid => 500,
            ErrorCode::DbInsertFailed => 500,
            ErrorCode::DbUpdateFailed => 500,
            ErrorCode::DbNotMigrated => 500,
            ErrorCode::BadGateway => 502,
            ErrorCode::UpstreamTimeout => 504,
            ErrorCode::StreamClosed => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy_table() {
        assert_eq!(OrchestratorError::not_found("x").http_status(), 404);
        assert_eq!(OrchestratorError::conflict("x").http_status(), 409);
        assert_eq!(OrchestratorError::stream_closed().http_status(), 500);
        assert_eq!(
            OrchestratorError::upstream_timeout("x").http_status(),
            504
        );
    }
}
