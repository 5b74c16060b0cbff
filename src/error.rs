use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Upstream blocked: {0}")]
    UpstreamBlocked(String),

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Malformed simplestream document: {0}")]
    ProtocolParse(String),

    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Mirror job already in progress for {0}")]
    DuplicateJob(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Stable machine-readable kind reported to API callers.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::UpstreamBlocked(_) => "upstream_blocked",
            ServerError::UpstreamUnreachable(_) => "upstream_unreachable",
            ServerError::ProtocolParse(_) => "protocol_parse_error",
            ServerError::ProductNotFound(_) => "product_not_found",
            ServerError::Integrity(_) => "integrity_error",
            ServerError::DuplicateJob(_) => "duplicate_job",
            ServerError::Validation(_) => "validation_error",
            ServerError::Storage(_) => "storage_error",
            ServerError::NotFound(_) => "not_found",
            ServerError::Conflict(_) => "conflict",
            ServerError::Database(_) => "database_error",
            ServerError::Io(_) => "storage_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::UpstreamBlocked(_) => StatusCode::BAD_REQUEST,
            ServerError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            ServerError::ProtocolParse(_) => StatusCode::BAD_GATEWAY,
            ServerError::ProductNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Integrity(_) => StatusCode::BAD_GATEWAY,
            ServerError::DuplicateJob(_) => StatusCode::CONFLICT,
            ServerError::Validation(_) => StatusCode::BAD_REQUEST,
            ServerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            // Don't leak SQL or filesystem details to API callers
            ServerError::Database(e) => {
                tracing::error!("Database error: {}", e);
                "Internal server error".to_string()
            }
            ServerError::Io(e) => {
                tracing::error!("IO error: {}", e);
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = serde_json::json!({
            "error": self.kind(),
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
