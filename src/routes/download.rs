use axum::{
    body::Body,
    extract::{Path, State},
    http::header::{CONTENT_LENGTH, CONTENT_TYPE},
    response::Response,
};
use blob_store::{is_not_found, BlobObject};

use super::RouteState;
use crate::{
    chunk_store::ChunkStoreError,
    http_objects::ApiError,
    key_scheme::{parse_chunk_key, validate_identifier},
};

const OCTET_STREAM: &str = "application/octet-stream";

fn stream_response(object: BlobObject) -> Result<Response<Body>, ApiError> {
    Response::builder()
        .header(CONTENT_TYPE, OCTET_STREAM)
        .header(CONTENT_LENGTH, object.meta.size_bytes.to_string())
        .body(Body::from_stream(object.body))
        .map_err(|e| ApiError::internal_error(e.into()))
}

/// Download a merged file
#[utoipa::path(
    get,
    path = "/uploads/merged/{file_name}",
    tag = "retrieve",
    params(
        ("file_name" = String, Path, description = "Name the file was merged under"),
    ),
    responses(
        (status = 200, description = "merged file contents"),
        (status = NOT_FOUND, description = "no merged file with that name", body = ApiError),
        (status = INTERNAL_SERVER_ERROR, description = "Internal Server Error", body = ApiError)
    ),
)]
pub async fn download_merged(
    Path(file_name): Path<String>,
    State(state): State<RouteState>,
) -> Result<Response<Body>, ApiError> {
    validate_identifier("fileName", &file_name)?;
    let object = state
        .artifact_store
        .open(&file_name)
        .await
        .map_err(|err| {
            if is_not_found(&err) {
                ApiError::not_found(&format!("merged file {} not found", file_name))
            } else {
                ApiError::internal_error(err)
            }
        })?;
    stream_response(object)
}

/// Download a single stored chunk
#[utoipa::path(
    get,
    path = "/uploads/chunks/{key}",
    tag = "retrieve",
    params(
        ("key" = String, Path, description = "Chunk key as returned by the upload call"),
    ),
    responses(
        (status = 200, description = "chunk contents"),
        (status = NOT_FOUND, description = "no chunk with that key", body = ApiError),
        (status = INTERNAL_SERVER_ERROR, description = "Internal Server Error", body = ApiError)
    ),
)]
pub async fn download_chunk(
    Path(key): Path<String>,
    State(state): State<RouteState>,
) -> Result<Response<Body>, ApiError> {
    let not_found = || ApiError::not_found(&format!("chunk {} not found", key));
    let (upload_id, _) = parse_chunk_key(&key).ok_or_else(not_found)?;
    if validate_identifier("uploadId", upload_id).is_err() {
        return Err(not_found());
    }
    let to_api_error = |err: ChunkStoreError| match err {
        ChunkStoreError::NotFound { .. } => not_found(),
        ChunkStoreError::Storage(err) => ApiError::internal_error(err),
    };
    let object = state
        .chunk_store
        .open_key(&key)
        .await
        .map_err(to_api_error)?;
    stream_response(object)
}
