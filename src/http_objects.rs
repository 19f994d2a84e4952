use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

use crate::{key_scheme::IdentifierError, reassembly::MergeError};

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    #[serde(rename = "error")]
    message: String,
    #[serde(rename = "missingChunks", skip_serializing_if = "Option::is_none")]
    missing_chunks: Option<Vec<u64>>,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
            missing_chunks: None,
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, &format!("{:#}", e))
    }

    pub fn missing_chunks(missing: Vec<u64>) -> Self {
        Self {
            status_code: StatusCode::CONFLICT,
            message: format!("{} chunk(s) missing, merge aborted", missing.len()),
            missing_chunks: Some(missing),
        }
    }

    #[cfg(test)]
    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    #[cfg(test)]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, Json(self)).into_response()
    }
}

impl From<IdentifierError> for ApiError {
    fn from(e: IdentifierError) -> Self {
        Self::bad_request(&e.to_string())
    }
}

impl From<MergeError> for ApiError {
    fn from(e: MergeError) -> Self {
        let message = e.to_string();
        match e {
            MergeError::MissingChunks(missing) => Self::missing_chunks(missing),
            MergeError::InvalidRequest(_) => Self::bad_request(&message),
            MergeError::Storage(_) | MergeError::Output(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, &message)
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkResponse {
    pub success: bool,
    /// Storage key the chunk was written under.
    pub key: String,
    pub index: u64,
    pub size: u64,
    /// Echoed from the request; never used server-side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,
}

/// Multipart body for chunk uploads. Metadata may also be sent as
/// `X-Chunk-Id`, `X-Chunk-Index` and `X-Total-Chunks` headers.
#[allow(dead_code)]
#[derive(ToSchema)]
#[schema(rename_all = "camelCase")]
pub struct UploadChunkForm {
    upload_id: Option<String>,
    chunk_index: Option<u64>,
    total_chunks: Option<u64>,
    #[schema(format = "binary")]
    file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MergeChunksRequest {
    pub file_name: Option<String>,
    pub total_chunks: Option<u64>,
    pub upload_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MergeChunksResponse {
    pub success: bool,
    pub file_url: String,
    pub size: u64,
    pub merged_chunks: u64,
    pub missing_chunks: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkIndicesResponse {
    pub upload_id: String,
    pub indices: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_shape() {
        let body = serde_json::to_value(ApiError::bad_request("missing uploadId")).unwrap();
        assert_eq!(body, serde_json::json!({ "error": "missing uploadId" }));

        let err = ApiError::from(MergeError::MissingChunks(vec![1, 4]));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        let body = serde_json::to_value(&err).unwrap();
        assert_eq!(body["missingChunks"], serde_json::json!([1, 4]));
    }

    #[test]
    fn test_merge_request_accepts_partial_body() {
        let req: MergeChunksRequest =
            serde_json::from_str(r#"{"fileName":"a.bin","totalChunks":3}"#).unwrap();
        assert_eq!(req.file_name.as_deref(), Some("a.bin"));
        assert_eq!(req.total_chunks, Some(3));
        assert!(req.upload_id.is_none());
    }
}
