//! HTTP API for the document pipeline service.
//!
//! Endpoints:
//! - `POST /api/documents` — upload a document and start its pipeline
//! - `POST /api/documents/{id}/process` — re-trigger an existing document
//! - `GET /api/documents/{id}` — status with per-stage timings
//! - `GET /api/documents/{id}/chunks` — chunk inventory once chunking ran
//! - `GET /health`

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::db::Database;
use crate::pipeline::PipelineOrchestrator;
use crate::storage::ArtifactStore;

pub mod documents;
use documents::{
    get_document_chunks_handler, get_document_handler, process_document_handler,
    upload_document_handler,
};

const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Application state
pub struct AppState {
    pub db: Arc<Database>,
    pub store: Arc<dyn ArtifactStore>,
    pub orchestrator: Arc<PipelineOrchestrator>,
}

/// Build the API router
pub fn router(
    db: Arc<Database>,
    store: Arc<dyn ArtifactStore>,
    orchestrator: Arc<PipelineOrchestrator>,
) -> Router {
    let state = Arc::new(AppState {
        db,
        store,
        orchestrator,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route(
            "/documents",
            post(upload_document_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/documents/{id}", get(get_document_handler))
        .route("/documents/{id}/process", post(process_document_handler))
        .route("/documents/{id}/chunks", get(get_document_chunks_handler));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler(State(_state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
