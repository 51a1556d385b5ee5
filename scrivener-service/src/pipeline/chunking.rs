//! Chunking stage runner and the section chunker.
//!
//! Chunking never appends: the stage replaces the document's entire chunk set
//! in the database, and chunk artifacts overwrite their deterministic
//! addresses, so a re-run leaves no stale chunks behind.

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use uuid::Uuid;

use super::context::StageContext;
use super::dispatcher::{StageRunner, StageSummary};
use super::state::Stage;
use crate::db::{Chunk, Database};
use crate::error::{ServiceError, StageFailure};
use crate::parsing::envelope::EnrichedDocument;
use crate::parsing::normalizer::Section;
use crate::storage::{ArtifactKind, ArtifactStore, artifact_path};
use crate::vector::VectorIndex;

/// A chunk before persistence: its text plus positional metadata.
#[derive(Debug, Clone)]
pub struct ChunkDraft {
    pub content: String,
    pub token_count: u32,
    pub page_number: u32,
    pub section_count: u32,
}

/// Splits a parsed document's sections into retrieval-sized chunks.
pub trait Chunker: Send + Sync {
    fn chunk(&self, sections: &[Section]) -> Vec<ChunkDraft>;
}

/// Greedy chunker: accumulates whole sections until the token budget would
/// overflow, then starts a new chunk. A single oversized section becomes its
/// own chunk rather than being split mid-sentence.
pub struct SectionChunker {
    max_tokens: u32,
}

impl SectionChunker {
    pub fn new(max_tokens: u32) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
        }
    }
}

/// Rough token estimate; close enough for budgeting chunk sizes.
fn estimate_tokens(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}

impl Chunker for SectionChunker {
    fn chunk(&self, sections: &[Section]) -> Vec<ChunkDraft> {
        let mut chunks = Vec::new();
        let mut buffer: Vec<&Section> = Vec::new();
        let mut buffer_tokens = 0u32;

        let flush = |buffer: &mut Vec<&Section>, tokens: &mut u32, chunks: &mut Vec<ChunkDraft>| {
            if buffer.is_empty() {
                return;
            }
            let content = buffer
                .iter()
                .map(|s| s.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            chunks.push(ChunkDraft {
                token_count: estimate_tokens(&content),
                page_number: buffer[0].page_number,
                section_count: buffer.len() as u32,
                content,
            });
            buffer.clear();
            *tokens = 0;
        };

        for section in sections {
            let tokens = estimate_tokens(&section.content);
            if !buffer.is_empty() && buffer_tokens + tokens > self.max_tokens {
                flush(&mut buffer, &mut buffer_tokens, &mut chunks);
            }
            buffer.push(section);
            buffer_tokens += tokens;
        }
        flush(&mut buffer, &mut buffer_tokens, &mut chunks);

        chunks
    }
}

pub struct ChunkingStage {
    db: Arc<Database>,
    store: Arc<dyn ArtifactStore>,
    chunker: Arc<dyn Chunker>,
    index: Arc<dyn VectorIndex>,
}

impl ChunkingStage {
    pub fn new(
        db: Arc<Database>,
        store: Arc<dyn ArtifactStore>,
        chunker: Arc<dyn Chunker>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            db,
            store,
            chunker,
            index,
        }
    }
}

impl StageRunner for ChunkingStage {
    fn stage(&self) -> Stage {
        Stage::Chunking
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
                .mark_stage_started(&ctx.document_id, Stage::Chunking)
                .map_err(StageFailure::from)?;

            let enriched_path = document.enriched_path.clone().ok_or_else(|| {
                StageFailure::terminal("document has no parsed artifact to chunk")
            })?;

            let payload = self.store.download(&enriched_path).await?;
            let envelope: EnrichedDocument = serde_json::from_slice(&payload)
                .map_err(|e| StageFailure::terminal(format!("parsed artifact is invalid: {e}")))?;

            let drafts = self.chunker.chunk(&envelope.sections);

            // The previous run's chunk set is about to be replaced. Addresses
            // shared with the new set get overwritten below; anything beyond
            // the new count, and its vectors, would otherwise go stale.
            let old_chunks = self
                .db
                .get_chunks(&ctx.document_id)
                .map_err(StageFailure::from)?;
            let stale_vector_ids: Vec<String> = old_chunks
                .iter()
                .filter_map(|c| c.vector_id.clone())
                .collect();
            if !stale_vector_ids.is_empty() {
                self.index
                    .delete(&ctx.project_id, &stale_vector_ids)
                    .await
                    .map_err(StageFailure::from)?;
            }
            for old in old_chunks.iter().skip(drafts.len()) {
                self.store.delete(&old.storage_path).await?;
            }

            let now = Utc::now();
            let mut rows = Vec::with_capacity(drafts.len());
            for (index, draft) in drafts.iter().enumerate() {
                let storage_path = artifact_path(
                    &ctx.organization_id,
                    &ctx.project_id,
                    &ctx.document_id,
                    ArtifactKind::Chunks,
                    &format!("chunk_{index}.json"),
                );

                let chunk_payload = json!({
                    "document_id": &ctx.document_id,
                    "chunk_index": index,
                    "content": &draft.content,
                    "token_count": draft.token_count,
                    "page_number": draft.page_number,
                    "section_count": draft.section_count,
                });
                let bytes = serde_json::to_vec(&chunk_payload)
                    .map_err(|e| StageFailure::terminal(e.to_string()))?;
                self.store
                    .upload(&storage_path, &bytes, "application/json")
                    .await?;

                rows.push(Chunk {
                    id: Uuid::new_v4().to_string(),
                    document_id: ctx.document_id.clone(),
                    chunk_index: index as u32,
                    token_count: draft.token_count,
                    storage_path,
                    vector_id: None,
                    metadata: Some(json!({
                        "page_number": draft.page_number,
                        "section_count": draft.section_count,
                    })),
                    created_at: now,
                });
            }

            // An empty section list yields zero chunks; that is still a
            // successful chunking run.
            self.db
                .replace_chunks(&ctx.document_id, &rows)
                .map_err(StageFailure::from)?;
            self.db
                .record_chunk_total(&ctx.document_id, rows.len())
                .map_err(StageFailure::from)?;
            self.db
                .mark_stage_completed(&ctx.document_id, Stage::Chunking)
                .map_err(StageFailure::from)?;

            Ok(StageSummary::new(format!("{} chunks", rows.len())))
        })
    }
}
