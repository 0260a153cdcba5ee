use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::UnknownVariant;

/// AuthError
///
/// Failures of the hosted auth collaborator as seen by callers of the session
/// operations. Returned to the calling view; never written into session state.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No auth collaborator is configured for this deployment.
    #[error("auth client is not initialized")]
    NotInitialized,
    /// The auth service rejected the e-mail/password pair.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    /// The auth service refused the request for another reason (duplicate e-mail, weak password).
    #[error("auth service rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// A presented access token failed verification.
    #[error("invalid access token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    /// The auth service could not be reached or answered with an unreadable body.
    #[error("auth service unavailable: {0}")]
    Transport(#[from] reqwest::Error),
}

impl AuthError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::NotInitialized => "auth_not_initialized",
            AuthError::InvalidCredentials(_) => "invalid_credentials",
            AuthError::Rejected { .. } => "auth_rejected",
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::Transport(_) => "auth_unavailable",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::InvalidCredentials(_) | AuthError::InvalidToken(_) => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::Rejected { .. } => StatusCode::BAD_REQUEST,
            AuthError::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    error_code: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.to_string(),
            error_code: self.error_code(),
        });
        (self.status_code(), body).into_response()
    }
}

/// QueryError
///
/// Failures of the data collaborator (PostgREST or direct Postgres).
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no {table} record for {id}")]
    NotFound { table: &'static str, id: Uuid },
    #[error("data api request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("data api returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueryError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            QueryError::NotFound { .. } => false,
            QueryError::Request(e) => !e.is_decode(),
            QueryError::Status { status, .. } => *status >= 500 || *status == 429,
            QueryError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
        }
    }
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = match &self {
            QueryError::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_GATEWAY,
        };
        tracing::error!(error = %self, "data collaborator failure");
        let body = Json(ErrorBody {
            error: self.to_string(),
            error_code: "data_unavailable",
        });
        (status, body).into_response()
    }
}

/// ProfileFetchError
///
/// Why a profile resolution failed. Logged and recorded in the session state,
/// never propagated to the gate.
#[derive(Debug, Error)]
pub enum ProfileFetchError {
    #[error("no active auth session to authorize the profile query")]
    NoSession,
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("malformed profile record: {0}")]
    InvalidRecord(#[from] UnknownVariant),
}

impl ProfileFetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            ProfileFetchError::Query(e) => e.is_transient(),
            ProfileFetchError::NoSession | ProfileFetchError::InvalidRecord(_) => false,
        }
    }
}
