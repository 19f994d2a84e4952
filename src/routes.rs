use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, MatchedPath, Request},
    http::{header::CONTENT_TYPE, HeaderName, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    artifact_store::ArtifactStore,
    chunk_store::ChunkStore,
    http_objects::{
        ApiError,
        ChunkIndicesResponse,
        MergeChunksRequest,
        MergeChunksResponse,
        UploadChunkForm,
        UploadChunkResponse,
    },
    key_scheme::KeyScheme,
    metrics::api_io_stats,
    reassembly::ReassemblyEngine,
};

mod download;
mod ingest;
mod merge;
pub use download::{download_chunk, download_merged};
pub use ingest::{
    list_chunk_indices,
    upload_chunk,
    CHUNK_ID_HEADER,
    CHUNK_INDEX_HEADER,
    TOTAL_CHUNKS_HEADER,
};
pub use merge::merge_chunks;

#[derive(OpenApi)]
#[openapi(
        paths(
            ingest::upload_chunk,
            ingest::list_chunk_indices,
            merge::merge_chunks,
            download::download_merged,
            download::download_chunk,
        ),
        components(
            schemas(
                ApiError,
                UploadChunkForm,
                UploadChunkResponse,
                MergeChunksRequest,
                MergeChunksResponse,
                ChunkIndicesResponse,
            )
        ),
        tags(
            (name = "chunkyard", description = "Chunked upload API")
        )
    )]
struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub engine: Arc<ReassemblyEngine>,
    pub chunk_store: ChunkStore,
    pub artifact_store: ArtifactStore,
    pub key_scheme: KeyScheme,
    pub metrics: Arc<api_io_stats::Metrics>,
}

pub fn create_routes(route_state: RouteState, max_body_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_origin(Any)
        .allow_headers([
            CONTENT_TYPE,
            HeaderName::from_static(CHUNK_ID_HEADER),
            HeaderName::from_static(CHUNK_INDEX_HEADER),
            HeaderName::from_static(TOTAL_CHUNKS_HEADER),
        ]);

    Router::new()
        .merge(SwaggerUi::new("/docs/swagger").url("/docs/openapi.json", ApiDoc::openapi()))
        .route("/", get(index))
        .route(
            "/api/upload-chunk",
            post(upload_chunk).with_state(route_state.clone()),
        )
        .route(
            "/api/merge-chunks",
            post(merge_chunks).with_state(route_state.clone()),
        )
        .route(
            "/api/uploads/{upload_id}/chunks",
            get(list_chunk_indices).with_state(route_state.clone()),
        )
        .route(
            "/uploads/merged/{file_name}",
            get(download_merged).with_state(route_state.clone()),
        )
        .route(
            "/uploads/chunks/{key}",
            get(download_chunk).with_state(route_state.clone()),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
        .layer(DefaultBodyLimit::max(max_body_bytes))
}

async fn index() -> &'static str {
    "Chunkyard Server"
}
