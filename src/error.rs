use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

/// Convenience type alias for Results with AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Main error type for the orchestrator.
///
/// Every variant that can reach the wire carries a machine-readable code
/// and HTTP status via [`AppError::wire_code`] / [`AppError::status_code`],
/// matching the taxonomy the control plane publishes.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("task already claimed: {task_id}")]
    TaskAlreadyClaimed { task_id: String },

    #[error("claim not found: {task_id}")]
    ClaimNotFound { task_id: String },

    #[error("not claim owner: session {session_id} does not own claim on {task_id}")]
    NotClaimOwner { task_id: String, session_id: i64 },

    #[error("session not found: {0}")]
    SessionNotFound(i64),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("coordination database unavailable: {0}")]
    CoordinationDbUnavailable(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("cyclic dependency detected involving task {0}")]
    CyclicDependency(String),

    #[error("task store corrupted: {0}")]
    StoreCorrupted(String),

    #[error("task store lock unavailable: {0}")]
    StoreLocked(String),

    #[error("subprocess error: {0}")]
    Subprocess(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("filesystem watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Unauthorized")]
    Unauthorized,
}

impl AppError {
    /// Machine-readable wire code, per the HTTP error taxonomy.
    pub fn wire_code(&self) -> &'static str {
        match self {
            AppError::TaskAlreadyClaimed { .. } => "TASK_ALREADY_CLAIMED",
            AppError::ClaimNotFound { .. } => "CLAIM_NOT_FOUND",
            AppError::NotClaimOwner { .. } => "NOT_CLAIM_OWNER",
            AppError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            AppError::TaskNotFound(_) => "TASK_NOT_FOUND",
            AppError::CoordinationDbUnavailable(_) | AppError::Db(_) => {
                "COORDINATION_DB_UNAVAILABLE"
            }
            AppError::Validation(_) | AppError::CyclicDependency(_) => "VALIDATION_ERROR",
            AppError::Unauthorized => "UNAUTHORIZED",
            _ => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::TaskAlreadyClaimed { .. } => StatusCode::CONFLICT,
            AppError::ClaimNotFound { .. }
            | AppError::SessionNotFound(_)
            | AppError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotClaimOwner { .. } => StatusCode::FORBIDDEN,
            AppError::CoordinationDbUnavailable(_) | AppError::Db(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Validation(_) | AppError::CyclicDependency(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.wire_code();
        tracing::warn!(error = %self, code, "request failed");
        (
            status,
            Json(json!({ "error": code, "details": self.to_string() })),
        )
            .into_response()
    }
}
