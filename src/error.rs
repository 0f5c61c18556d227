use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Price source failed, timed out, or returned no price.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Comparator failed or returned output that did not validate.
    #[error("Matching unavailable: {0}")]
    MatchingUnavailable(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    /// Rejected at the boundary before any state mutation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No active {marketplace} listing for item {item_id}")]
    NoActiveListing { item_id: String, marketplace: String },

    #[error("No pending {marketplace} listing for item {item_id}")]
    NoPendingListing { item_id: String, marketplace: String },

    #[error("A reconciliation run is already in progress")]
    RunInProgress,

    #[error("Timed out after {0}ms")]
    Timeout(u64),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Transient failures worth another attempt under the retry policy.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AppError::Http(_)
                | AppError::SourceUnavailable(_)
                | AppError::MatchingUnavailable(_)
                | AppError::Notification(_)
                | AppError::Timeout(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::NoActiveListing { .. } | AppError::NoPendingListing { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppError::RunInProgress => StatusCode::CONFLICT,
            AppError::SourceUnavailable(_)
            | AppError::MatchingUnavailable(_)
            | AppError::Notification(_)
            | AppError::Http(_)
            | AppError::Timeout(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
