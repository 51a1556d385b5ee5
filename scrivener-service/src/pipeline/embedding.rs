//! Embedding stage runner.
//!
//! Embeds every chunk, upserts the vectors under the project's namespace, and
//! promotes the document to ready. Vector ids are deterministic
//! (`{document_id}:{chunk_index}`), so a re-run overwrites instead of
//! duplicating vectors.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use super::context::StageContext;
use super::dispatcher::{StageRunner, StageSummary};
use super::state::Stage;
use crate::db::Database;
use crate::error::{ServiceError, StageFailure};
use crate::pipeline::state::DocumentStatus;
use crate::storage::ArtifactStore;
use crate::vector::{Embedder, VectorIndex, VectorRecord};

pub struct EmbeddingStage {
    db: Arc<Database>,
    store: Arc<dyn ArtifactStore>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl EmbeddingStage {
    pub fn new(
        db: Arc<Database>,
        store: Arc<dyn ArtifactStore>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            db,
            store,
            embedder,
            index,
        }
    }
}

impl StageRunner for EmbeddingStage {
    fn stage(&self) -> Stage {
        Stage::Embedding
    }

    fn run<'a>(
        &'a self,
        ctx: &'a StageContext,
    ) -> BoxFuture<'a, Result<StageSummary, StageFailure>> {
        Box::pin(async move {
            let document = self
                .db
                .get_document(&ctx.document_id)
                .map_err(StageFailure::from)?
                .ok_or_else(|| {
                    StageFailure::from(ServiceError::DocumentNotFound {
                        document_id: ctx.document_id.clone(),
                    })
                })?;

            self.db
                .mark_stage_started(&ctx.document_id, Stage::Embedding)
                .map_err(StageFailure::from)?;

            let chunks = self
                .db
                .get_chunks(&ctx.document_id)
                .map_err(StageFailure::from)?;

            let mut records = Vec::with_capacity(chunks.len());
            let mut assignments = Vec::with_capacity(chunks.len());
            for chunk in &chunks {
                let payload = self.store.download(&chunk.storage_path).await?;
                let value: serde_json::Value = serde_json::from_slice(&payload).map_err(|e| {
                    StageFailure::terminal(format!("chunk artifact is invalid: {e}"))
                })?;
                let content = value
                    .get("content")
                    .and_then(|c| c.as_str())
                    .ok_or_else(|| {
                        StageFailure::terminal("chunk artifact has no content field")
                    })?;

                let vector = self.embedder.embed(content).await.map_err(StageFailure::from)?;

                let vector_id = format!("{}:{}", ctx.document_id, chunk.chunk_index);
                records.push(VectorRecord {
                    id: vector_id.clone(),
                    vector,
                    metadata: json!({
                        "document_id": &ctx.document_id,
                        "organization_id": &ctx.organization_id,
                        "chunk_index": chunk.chunk_index,
                        "document_name": &document.name,
                        "storage_path": &chunk.storage_path,
                    }),
                });
                assignments.push((chunk.id.clone(), vector_id));
            }

            // Vectors are partitioned by project: one namespace per tenant.
            if !records.is_empty() {
                self.index
                    .upsert(&ctx.project_id, records)
                    .await
                    .map_err(StageFailure::from)?;
            }
            for (chunk_id, vector_id) in &assignments {
                self.db
                    .set_chunk_vector_id(chunk_id, vector_id)
                    .map_err(StageFailure::from)?;
            }

            self.db
                .mark_stage_completed(&ctx.document_id, Stage::Embedding)
                .map_err(StageFailure::from)?;
            self.db
                .update_status(&ctx.document_id, DocumentStatus::Ready)
                .map_err(StageFailure::from)?;

            Ok(StageSummary::new(format!(
                "{} vectors upserted",
                assignments.len()
            )))
        })
    }
}
