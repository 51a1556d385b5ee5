//! Document endpoints: upload, status, re-trigger, chunk inventory.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
};
use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::AppState;
use crate::db::{Chunk, Document, StageRecord};
use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::state::{DocumentStatus, STAGE_SEQUENCE};
use crate::storage::{ArtifactKind, artifact_path};

/// Document plus its per-stage timing view.
#[derive(Serialize)]
pub struct DocumentView {
    #[serde(flatten)]
    pub document: Document,
    pub stages: Vec<StageRecord>,
}

impl DocumentView {
    fn new(document: Document) -> Self {
        let stages = STAGE_SEQUENCE
            .iter()
            .map(|stage| document.stage_record(*stage))
            .collect();
        Self { document, stages }
    }
}

#[derive(Serialize)]
pub struct ChunkListResponse {
    pub document_id: String,
    pub total_chunks: usize,
    pub chunks: Vec<Chunk>,
}

/// Upload a document (multipart: `organization_id`, `project_id`, optional
/// `name`, and the `file` field) and start its pipeline.
pub async fn upload_document_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ServiceResult<(StatusCode, Json<DocumentView>)> {
    let mut organization_id = None;
    let mut project_id = None;
    let mut name = None;
    let mut file: Option<(String, String, Vec<u8>)> = None;

    while let Some(field) =
        multipart
            .next_field()
            .await
            .map_err(|e| ServiceError::InvalidRequest {
                message: format!("could not read multipart body: {e}"),
            })?
    {
        match field.name() {
            Some("organization_id") => {
                organization_id = field.text().await.ok();
            }
            Some("project_id") => {
                project_id = field.text().await.ok();
            }
            Some("name") => {
                name = field.text().await.ok();
            }
            Some("file") => {
                let filename = field
                    .file_name()
                    .map(|f| f.to_string())
                    .ok_or_else(|| ServiceError::InvalidRequest {
                        message: "file field has no filename".to_string(),
                    })?;
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(|e| {
                    ServiceError::InvalidRequest {
                        message: format!("could not read file field: {e}"),
                    }
                })?;
                file = Some((filename, content_type, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let organization_id = organization_id.ok_or_else(|| ServiceError::InvalidRequest {
        message: "organization_id is required".to_string(),
    })?;
    let project_id = project_id.ok_or_else(|| ServiceError::InvalidRequest {
        message: "project_id is required".to_string(),
    })?;
    let (filename, media_type, content) = file.ok_or_else(|| ServiceError::InvalidRequest {
        message: "file is required".to_string(),
    })?;
    if content.is_empty() {
        return Err(ServiceError::InvalidRequest {
            message: "uploaded file is empty".to_string(),
        });
    }

    let id = Uuid::new_v4().to_string();
    let raw_path = artifact_path(
        &organization_id,
        &project_id,
        &id,
        ArtifactKind::Raw,
        &filename,
    );

    let now = Utc::now();
    let document = Document {
        id: id.clone(),
        organization_id,
        project_id,
        name: name.unwrap_or_else(|| filename.clone()),
        original_filename: filename,
        size: content.len() as u64,
        media_type,
        status: DocumentStatus::Uploading,
        raw_path: raw_path.clone(),
        is_converted: false,
        converted_path: None,
        enriched_path: None,
        total_chunks: 0,
        conversion_started_at: None,
        conversion_completed_at: None,
        parsing_started_at: None,
        parsing_completed_at: None,
        chunking_started_at: None,
        chunking_completed_at: None,
        embedding_started_at: None,
        embedding_completed_at: None,
        error_message: None,
        document_metadata: None,
        created_at: now,
        updated_at: now,
    };

    state.db.insert_document(&document)?;

    // Persist the raw bytes before the document becomes visible as uploaded.
    if let Err(e) = state
        .store
        .upload(&raw_path, &content, &document.media_type)
        .await
    {
        let _ = state.db.mark_upload_failed(&id, &e.to_string());
        return Err(ServiceError::Storage(e));
    }
    state.db.update_status(&id, DocumentStatus::Uploaded)?;

    info!(
        document_id = %id,
        filename = %document.original_filename,
        bytes = content.len(),
        "Document uploaded"
    );

    state.orchestrator.run(&id)?;

    let document = state
        .db
        .get_document(&id)?
        .ok_or_else(|| ServiceError::DocumentNotFound { document_id: id })?;

    Ok((StatusCode::ACCEPTED, Json(DocumentView::new(document))))
}

/// Re-trigger the pipeline for an existing document.
pub async fn process_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<(StatusCode, Json<DocumentView>)> {
    state.orchestrator.run(&id)?;

    let document = state
        .db
        .get_document(&id)?
        .ok_or_else(|| ServiceError::DocumentNotFound { document_id: id })?;

    Ok((StatusCode::ACCEPTED, Json(DocumentView::new(document))))
}

/// Document status with per-stage timings.
pub async fn get_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<Json<DocumentView>> {
    let document = state
        .db
        .get_document(&id)?
        .ok_or_else(|| ServiceError::DocumentNotFound { document_id: id })?;

    Ok(Json(DocumentView::new(document)))
}

/// Chunk inventory for a document.
pub async fn get_document_chunks_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<Json<ChunkListResponse>> {
    let document = state
        .db
        .get_document(&id)?
        .ok_or_else(|| ServiceError::DocumentNotFound {
            document_id: id.clone(),
        })?;

    let chunks = state.db.get_chunks(&id)?;
    Ok(Json(ChunkListResponse {
        document_id: document.id,
        total_chunks: chunks.len(),
        chunks,
    }))
}
