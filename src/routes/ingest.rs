use axum::{
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::HeaderMap,
    Json,
};
use futures::StreamExt;
use tracing::{debug, error, info};

use super::RouteState;
use crate::{
    chunk_store::StoredChunk,
    http_objects::{ApiError, ChunkIndicesResponse, UploadChunkForm, UploadChunkResponse},
    key_scheme::validate_identifier,
    metrics::AutoIncrement,
};

pub const CHUNK_ID_HEADER: &str = "x-chunk-id";
pub const CHUNK_INDEX_HEADER: &str = "x-chunk-index";
pub const TOTAL_CHUNKS_HEADER: &str = "x-total-chunks";

const UPLOAD_ID_FIELD: &str = "uploadId";
const CHUNK_INDEX_FIELD: &str = "chunkIndex";
const TOTAL_CHUNKS_FIELD: &str = "totalChunks";
const FILE_FIELD: &str = "file";

/// Chunk metadata gathered from headers first, then from multipart text
/// fields for anything the headers left out.
#[derive(Debug, Default)]
struct ChunkMetadata {
    upload_id: Option<String>,
    index: Option<u64>,
    total_chunks: Option<u64>,
}

impl ChunkMetadata {
    fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let header = |name: &str| -> Result<Option<String>, ApiError> {
            headers
                .get(name)
                .map(|value| {
                    value
                        .to_str()
                        .map(|value| value.trim().to_string())
                        .map_err(|_| ApiError::bad_request(&format!("invalid {} header", name)))
                })
                .transpose()
        };
        Ok(Self {
            upload_id: header(CHUNK_ID_HEADER)?.filter(|value| !value.is_empty()),
            index: header(CHUNK_INDEX_HEADER)?
                .map(|value| parse_count(CHUNK_INDEX_HEADER, &value))
                .transpose()?,
            total_chunks: header(TOTAL_CHUNKS_HEADER)?
                .map(|value| parse_count(TOTAL_CHUNKS_HEADER, &value))
                .transpose()?,
        })
    }

    fn set_field(&mut self, name: &str, value: &str) -> Result<(), ApiError> {
        let value = value.trim();
        match name {
            UPLOAD_ID_FIELD if self.upload_id.is_none() && !value.is_empty() => {
                self.upload_id = Some(value.to_string());
            }
            CHUNK_INDEX_FIELD if self.index.is_none() => {
                self.index = Some(parse_count(name, value)?);
            }
            TOTAL_CHUNKS_FIELD if self.total_chunks.is_none() => {
                self.total_chunks = Some(parse_count(name, value)?);
            }
            _ => {}
        }
        Ok(())
    }

    fn require(&self) -> Result<(String, u64), ApiError> {
        let upload_id = self
            .upload_id
            .clone()
            .ok_or_else(|| ApiError::bad_request("missing uploadId"))?;
        validate_identifier(UPLOAD_ID_FIELD, &upload_id)?;
        let index = self
            .index
            .ok_or_else(|| ApiError::bad_request("missing chunkIndex"))?;
        Ok((upload_id, index))
    }
}

fn parse_count(name: &str, value: &str) -> Result<u64, ApiError> {
    value
        .parse::<u64>()
        .map_err(|_| ApiError::bad_request(&format!("{} must be a non-negative integer", name)))
}

fn store_error(err: anyhow::Error) -> ApiError {
    // The request body failing mid-stream is the client's doing.
    if err.chain().any(|cause| cause.is::<MultipartError>()) {
        return ApiError::bad_request(&format!("failed to read chunk body: {}", err));
    }
    error!("failed to store chunk: {:?}", err);
    ApiError::internal_error(err.context("failed to store chunk"))
}

/// Upload one chunk of a file
#[utoipa::path(
    post,
    path = "/api/upload-chunk",
    request_body(content_type = "multipart/form-data", content = inline(UploadChunkForm)),
    tag = "ingestion",
    responses(
        (status = 200, description = "chunk stored", body = UploadChunkResponse),
        (status = BAD_REQUEST, description = "missing or invalid chunk metadata", body = ApiError),
        (status = INTERNAL_SERVER_ERROR, description = "chunk could not be stored", body = ApiError)
    ),
)]
pub async fn upload_chunk(
    State(state): State<RouteState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadChunkResponse>, ApiError> {
    let mut metadata = ChunkMetadata::from_headers(&headers)?;
    let mut stored: Option<StoredChunk> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(&format!("invalid multipart body: {}", e)))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match name.as_str() {
            FILE_FIELD => {
                if stored.is_some() {
                    return Err(ApiError::bad_request("only one file part is allowed"));
                }
                let (upload_id, index) = metadata.require()?;
                let data = field.map(|res| res.map_err(anyhow::Error::from));
                let chunk = state
                    .chunk_store
                    .put(&upload_id, index, data)
                    .await
                    .map_err(store_error)?;
                stored = Some(chunk);
            }
            UPLOAD_ID_FIELD | CHUNK_INDEX_FIELD | TOTAL_CHUNKS_FIELD => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(&format!("invalid {} field: {}", name, e)))?;
                metadata.set_field(&name, &value)?;
            }
            _ => debug!(name, "ignoring unknown multipart field"),
        }
    }

    let Some(chunk) = stored else {
        // Report missing metadata ahead of the missing file.
        metadata.require()?;
        return Err(ApiError::bad_request("missing file part"));
    };
    let (_, index) = metadata.require()?;

    state.metrics.chunks.increment(&[]);
    state.metrics.chunk_bytes.add(chunk.size_bytes, &[]);
    info!(
        key = %chunk.key,
        index,
        size_bytes = chunk.size_bytes,
        total_chunks = ?metadata.total_chunks,
        "stored chunk"
    );

    Ok(Json(UploadChunkResponse {
        success: true,
        key: chunk.key,
        index,
        size: chunk.size_bytes,
        total_chunks: metadata.total_chunks,
    }))
}

/// List the chunk indices stored for an upload
#[utoipa::path(
    get,
    path = "/api/uploads/{upload_id}/chunks",
    tag = "ingestion",
    params(
        ("upload_id" = String, Path, description = "Identifier the chunks were uploaded under"),
    ),
    responses(
        (status = 200, description = "stored chunk indices, ascending", body = ChunkIndicesResponse),
        (status = BAD_REQUEST, description = "invalid upload identifier", body = ApiError),
        (status = INTERNAL_SERVER_ERROR, description = "Internal Server Error", body = ApiError)
    ),
)]
pub async fn list_chunk_indices(
    Path(upload_id): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<ChunkIndicesResponse>, ApiError> {
    validate_identifier(UPLOAD_ID_FIELD, &upload_id)?;
    let indices = state
        .chunk_store
        .list_indices(&upload_id)
        .await
        .map_err(ApiError::internal_error)?;
    Ok(Json(ChunkIndicesResponse {
        upload_id,
        indices: indices.into_iter().collect(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_headers_take_precedence_over_fields() {
        let mut headers = HeaderMap::new();
        headers.insert(CHUNK_ID_HEADER, HeaderValue::from_static("from-header"));
        headers.insert(CHUNK_INDEX_HEADER, HeaderValue::from_static("3"));

        let mut metadata = ChunkMetadata::from_headers(&headers).unwrap();
        metadata.set_field(UPLOAD_ID_FIELD, "from-field").unwrap();
        metadata.set_field(CHUNK_INDEX_FIELD, "9").unwrap();
        metadata.set_field(TOTAL_CHUNKS_FIELD, "10").unwrap();

        assert_eq!(metadata.require().unwrap(), ("from-header".to_string(), 3));
        assert_eq!(metadata.total_chunks, Some(10));
    }

    #[test]
    fn test_invalid_metadata_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(CHUNK_INDEX_HEADER, HeaderValue::from_static("-1"));
        assert!(ChunkMetadata::from_headers(&headers).is_err());

        let mut metadata = ChunkMetadata::default();
        assert!(metadata.set_field(CHUNK_INDEX_FIELD, "abc").is_err());
        metadata.set_field(CHUNK_INDEX_FIELD, "0").unwrap();
        assert!(metadata.require().is_err());

        metadata.set_field(UPLOAD_ID_FIELD, "../escape").unwrap();
        assert!(metadata.require().is_err());
    }
}
