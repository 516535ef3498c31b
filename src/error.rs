use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimdexError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Embedding service error: {0}")]
    Upstream(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Refusing to overwrite existing file: {}", .0.display())]
    PathConflict(PathBuf),

    #[error("Shard is already online: {0}")]
    ShardAlreadyAttached(String),

    #[error("Shard not found: {}", .0.display())]
    ShardMissing(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for SimdexError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            SimdexError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            SimdexError::ShardMissing(_) => (StatusCode::NOT_FOUND, self.to_string()),
            SimdexError::ShardAlreadyAttached(_) => (StatusCode::CONFLICT, self.to_string()),
            // Internal failures surface their message so operators can see
            // merge/search errors without shelling into the box.
            SimdexError::Upstream(_)
            | SimdexError::Format(_)
            | SimdexError::PathConflict(_)
            | SimdexError::Io(_)
            | SimdexError::Serde(_)
            | SimdexError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = json!({
            "message": message,
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

pub type SimdexResult<T> = Result<T, SimdexError>;
