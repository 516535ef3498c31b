use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use tracing::warn;

use crate::error::SimdexError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AttachParams {
    pub path: String,
}

/// `PUT /faiss` — hot-attach a freshly merged shard to the running pool.
/// 201 on attach, 404 when the path does not exist, 500 on attach failure.
/// Re-attaching a known shard is a warned no-op.
pub async fn attach_shard(
    State(state): State<AppState>,
    Query(params): Query<AttachParams>,
) -> Result<impl IntoResponse, SimdexError> {
    let path = PathBuf::from(&params.path);
    if !path.exists() {
        return Err(SimdexError::ShardMissing(path));
    }

    // Attaching waits on the pool's writer lock behind running searches.
    let pool = state.pool.clone();
    let attached = tokio::task::spawn_blocking(move || pool.add_shard(&path))
        .await
        .map_err(|e| SimdexError::Internal(anyhow::anyhow!("attach task failed: {e}")))?;

    match attached {
        Ok(()) => Ok((
            StatusCode::CREATED,
            Json(json!({"message": "successfully added shard to the pool"})),
        )),
        Err(SimdexError::ShardAlreadyAttached(name)) => {
            warn!(shard = %name, "shard is already online, ignoring attach");
            Ok((
                StatusCode::CREATED,
                Json(json!({"message": format!("shard {name} is already online")})),
            ))
        }
        Err(e) => Err(e),
    }
}
