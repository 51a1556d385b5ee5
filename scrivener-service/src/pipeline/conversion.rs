//! Conversion stage runner.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use super::context::StageContext;
use super::dispatcher::{StageRunner, StageSummary};
use super::state::Stage;
use crate::conversion::{Converter, needs_conversion};
use crate::db::Database;
use crate::error::{ServiceError, StageFailure};
use crate::storage::{ArtifactKind, ArtifactStore, artifact_path};

pub struct ConversionStage {
    db: Arc<Database>,
    store: Arc<dyn ArtifactStore>,
    converter: Arc<Converter>,
}

impl ConversionStage {
    pub fn new(db: Arc<Database>, store: Arc<dyn ArtifactStore>, converter: Arc<Converter>) -> Self {
        Self {
            db,
            store,
            converter,
        }
    }
}

impl StageRunner for ConversionStage {
    fn stage(&self) -> Stage {
        Stage::Conversion
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
                .mark_stage_started(&ctx.document_id, Stage::Conversion)
                .map_err(StageFailure::from)?;

            // Directly analyzable formats pass through untouched; the stage
            // still runs so the lifecycle records a start and a completion.
            if !needs_conversion(&document.original_filename) {
                debug!(
                    document_id = %ctx.document_id,
                    filename = %document.original_filename,
                    "No conversion needed"
                );
                self.db
                    .record_conversion(&ctx.document_id, false, None)
                    .map_err(StageFailure::from)?;
                self.db
                    .mark_stage_completed(&ctx.document_id, Stage::Conversion)
                    .map_err(StageFailure::from)?;
                return Ok(StageSummary::new("no conversion needed"));
            }

            let raw = self.store.download(&document.raw_path).await?;
            let (pdf, pdf_filename) = self
                .converter
                .convert_to_pdf(&raw, &document.original_filename)
                .await?;

            let converted_path = artifact_path(
                &ctx.organization_id,
                &ctx.project_id,
                &ctx.document_id,
                ArtifactKind::Converted,
                &pdf_filename,
            );
            self.store
                .upload(&converted_path, &pdf, "application/pdf")
                .await?;

            self.db
                .record_conversion(&ctx.document_id, true, Some(&converted_path))
                .map_err(StageFailure::from)?;
            self.db
                .mark_stage_completed(&ctx.document_id, Stage::Conversion)
                .map_err(StageFailure::from)?;

            Ok(StageSummary::new(format!(
                "converted to {pdf_filename} ({} bytes)",
                pdf.len()
            )))
        })
    }
}
