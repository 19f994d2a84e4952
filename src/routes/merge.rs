use axum::{extract::State, Json};

use super::RouteState;
use crate::{
    http_objects::{ApiError, MergeChunksRequest, MergeChunksResponse},
    reassembly::MergeSpec,
};

/// Merge an upload's chunks into one file
#[utoipa::path(
    post,
    path = "/api/merge-chunks",
    request_body = MergeChunksRequest,
    tag = "ingestion",
    responses(
        (status = 200, description = "merged file published", body = MergeChunksResponse),
        (status = BAD_REQUEST, description = "missing or invalid merge request fields", body = ApiError),
        (status = CONFLICT, description = "chunks missing and strict merging is enabled", body = ApiError),
        (status = INTERNAL_SERVER_ERROR, description = "chunks could not be read or the file written", body = ApiError)
    ),
)]
pub async fn merge_chunks(
    State(state): State<RouteState>,
    Json(request): Json<MergeChunksRequest>,
) -> Result<Json<MergeChunksResponse>, ApiError> {
    let file_name = request
        .file_name
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("missing fileName"))?;
    let total_chunks = request
        .total_chunks
        .ok_or_else(|| ApiError::bad_request("missing totalChunks"))?;
    let upload_id = state
        .key_scheme
        .merge_identifier(file_name, request.upload_id.as_deref())?;

    let outcome = state
        .engine
        .merge(&MergeSpec {
            upload_id,
            file_name: file_name.to_string(),
            total_chunks,
        })
        .await?;

    Ok(Json(MergeChunksResponse {
        success: true,
        file_url: outcome.file_url,
        size: outcome.size_bytes,
        merged_chunks: outcome.merged_chunks,
        missing_chunks: outcome.missing_indices,
    }))
}
