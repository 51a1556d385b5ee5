//! Parsing stage runner.

use std::sync::Arc;

use futures::future::BoxFuture;

use super::context::StageContext;
use super::dispatcher::{StageRunner, StageSummary};
use super::state::Stage;
use crate::db::Database;
use crate::error::{ServiceError, StageFailure};
use crate::parsing::{DocumentParser, ParserKind};
use crate::storage::{ArtifactKind, ArtifactStore, artifact_path};

pub struct ParsingStage {
    db: Arc<Database>,
    store: Arc<dyn ArtifactStore>,
    parser: Arc<DocumentParser>,
}

impl ParsingStage {
    pub fn new(
        db: Arc<Database>,
        store: Arc<dyn ArtifactStore>,
        parser: Arc<DocumentParser>,
    ) -> Self {
        Self { db, store, parser }
    }
}

impl StageRunner for ParsingStage {
    fn stage(&self) -> Stage {
        Stage::Parsing
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
                .mark_stage_started(&ctx.document_id, Stage::Parsing)
                .map_err(StageFailure::from)?;

            // Parse what the analyzer will actually see: the converted PDF
            // when one exists, the raw upload otherwise.
            let (address, filename) = if document.is_converted {
                let converted = document.converted_path.clone().ok_or_else(|| {
                    StageFailure::terminal(
                        "document marked converted but has no converted artifact",
                    )
                })?;
                let name = converted
                    .rsplit('/')
                    .next()
                    .unwrap_or("converted.pdf")
                    .to_string();
                (converted, name)
            } else {
                (
                    document.raw_path.clone(),
                    document.original_filename.clone(),
                )
            };

            let kind = ParserKind::classify(&filename)?;
            let content = self.store.download(&address).await?;

            let envelope = self
                .parser
                .parse(kind, &content, &filename, &ctx.document_id)
                .await?;

            let payload =
                serde_json::to_vec(&envelope).map_err(|e| StageFailure::terminal(e.to_string()))?;
            let enriched_path = artifact_path(
                &ctx.organization_id,
                &ctx.project_id,
                &ctx.document_id,
                ArtifactKind::Enriched,
                "enriched.json",
            );
            self.store
                .upload(&enriched_path, &payload, "application/json")
                .await?;

            let metadata = envelope
                .enriched_metadata
                .as_object()
                .filter(|o| !o.is_empty())
                .map(|_| envelope.enriched_metadata.clone());
            self.db
                .record_parsing_result(&ctx.document_id, &enriched_path, metadata.as_ref())
                .map_err(StageFailure::from)?;
            self.db
                .mark_stage_completed(&ctx.document_id, Stage::Parsing)
                .map_err(StageFailure::from)?;

            Ok(StageSummary::new(format!(
                "{} parser extracted {} sections",
                kind.name(),
                envelope.sections.len()
            )))
        })
    }
}
