//! The document pipeline: state machine, stage runners, and the orchestrator
//! that drives a document from uploaded to ready.

pub mod chunking;
pub mod context;
pub mod conversion;
pub mod dispatcher;
pub mod embedding;
pub mod parsing;
pub mod state;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::db::Database;
use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::context::StageContext;
use crate::pipeline::dispatcher::StageDispatcher;
use crate::pipeline::state::{DocumentStatus, STAGE_SEQUENCE, Stage};

/// A running pipeline job for one document.
pub struct JobHandle {
    pub document_id: String,
    handle: JoinHandle<()>,
}

impl JobHandle {
    /// Wait for the pipeline run to finish. The outcome is in the document's
    /// persisted status, not the return value.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }
}

/// Where to pick up the pipeline given the document's current status.
/// `None` means no stage is left to run.
fn resume_index(status: DocumentStatus) -> Option<usize> {
    match status {
        // A full re-trigger of a finished document starts over.
        DocumentStatus::Uploading
        | DocumentStatus::Uploaded
        | DocumentStatus::UploadFailed
        | DocumentStatus::Ready => Some(0),
        DocumentStatus::ConversionStarted | DocumentStatus::ConversionFailed => Some(0),
        DocumentStatus::ConversionComplete => Some(1),
        DocumentStatus::ParsingStarted | DocumentStatus::ParsingFailed => Some(1),
        DocumentStatus::ParsingComplete => Some(2),
        DocumentStatus::ChunkingStarted | DocumentStatus::ChunkingFailed => Some(2),
        DocumentStatus::ChunkingComplete => Some(3),
        DocumentStatus::EmbeddingStarted | DocumentStatus::EmbeddingFailed => Some(3),
        // Interrupted between embedding completion and the ready promotion.
        DocumentStatus::EmbeddingComplete => None,
    }
}

/// Drives documents through the stage sequence. At most one pipeline run per
/// document at a time; a second trigger while one is in flight is rejected
/// rather than queued.
pub struct PipelineOrchestrator {
    db: Arc<Database>,
    dispatcher: Arc<StageDispatcher>,
    in_flight: Arc<DashMap<String, ()>>,
}

impl PipelineOrchestrator {
    pub fn new(db: Arc<Database>, dispatcher: Arc<StageDispatcher>) -> Self {
        Self {
            db,
            dispatcher,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Start (or resume) the pipeline for a document.
    pub fn run(&self, document_id: &str) -> ServiceResult<JobHandle> {
        let document = self
            .db
            .get_document(document_id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })?;

        if document.status == DocumentStatus::Uploading {
            return Err(ServiceError::InvalidRequest {
                message: format!("document {document_id} is still uploading"),
            });
        }

        // Single-flight lease per document.
        match self.in_flight.entry(document_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ServiceError::PipelineBusy {
                    document_id: document_id.to_string(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
            }
        }

        let start = resume_index(document.status);
        let ctx = StageContext::for_document(&document);
        let db = self.db.clone();
        let dispatcher = self.dispatcher.clone();
        let in_flight = self.in_flight.clone();
        let id = document_id.to_string();

        info!(
            document_id = %id,
            status = document.status.as_str(),
            "Pipeline run starting"
        );

        let handle = tokio::spawn(async move {
            Self::drive(&db, &dispatcher, &ctx, start).await;
            in_flight.remove(&ctx.document_id);
        });

        Ok(JobHandle {
            document_id: id,
            handle,
        })
    }

    async fn drive(
        db: &Database,
        dispatcher: &StageDispatcher,
        ctx: &StageContext,
        start: Option<usize>,
    ) {
        let Some(start) = start else {
            // Everything embedded already; only the ready promotion is left.
            if let Err(e) = db.update_status(&ctx.document_id, DocumentStatus::Ready) {
                error!(document_id = %ctx.document_id, error = %e, "Could not promote document to ready");
            }
            return;
        };

        for stage in &STAGE_SEQUENCE[start..] {
            if let Err(e) = dispatcher.execute(*stage, ctx).await {
                // Stage failures were already persisted as `*_failed` by the
                // dispatcher. Anything else (dispatch errors, bad wiring)
                // gets the coarse terminal fallback, otherwise the document
                // would be parked non-terminal and re-resumed on every start.
                if !matches!(e, ServiceError::Stage(_)) {
                    if let Err(mark) = db.mark_upload_failed(&ctx.document_id, &e.to_string()) {
                        error!(
                            document_id = %ctx.document_id,
                            error = %mark,
                            "Could not mark document failed"
                        );
                    }
                }
                error!(
                    document_id = %ctx.document_id,
                    stage = stage.name(),
                    error = %e,
                    "Pipeline run stopped"
                );
                return;
            }
        }

        info!(document_id = %ctx.document_id, "Pipeline run finished");
    }

    /// Resume every document whose pipeline was interrupted. Called once at
    /// startup; failed and ready documents are left alone.
    pub fn resume_unfinished(&self) -> ServiceResult<Vec<JobHandle>> {
        let documents = self.db.get_unfinished_documents()?;
        let mut handles = Vec::with_capacity(documents.len());

        for document in documents {
            info!(
                document_id = %document.id,
                status = document.status.as_str(),
                "Resuming interrupted pipeline"
            );
            match self.run(&document.id) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(document_id = %document.id, error = %e, "Could not resume document")
                }
            }
        }

        Ok(handles)
    }

    #[cfg(test)]
    fn is_in_flight(&self, document_id: &str) -> bool {
        self.in_flight.contains_key(document_id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::BoxFuture;

    use super::*;
    use crate::analysis::test_support::ScriptedTransport;
    use crate::analysis::{
        AnalyzedPage, AnalyzedParagraph, AnalyzedSpan, BoundingRegion, DocumentAnalyzer,
        RawAnalysis,
    };
    use crate::db::test_support::sample_document;
    use crate::error::AnalysisError;
    use crate::parsing::DocumentParser;
    use crate::pipeline::chunking::{ChunkingStage, SectionChunker};
    use crate::pipeline::conversion::ConversionStage;
    use crate::pipeline::dispatcher::{StageRegistry, StageRunner, StageSummary};
    use crate::pipeline::embedding::EmbeddingStage;
    use crate::pipeline::parsing::ParsingStage;
    use crate::storage::memory::MemoryArtifactStore;
    use crate::storage::{ArtifactKind, ArtifactStore, artifact_path};
    use crate::vector::{Embedder, InMemoryVectorIndex};
    use crate::conversion::Converter;
    use crate::config::ConversionConfig;
    use crate::error::{ServiceResult, StageFailure};

    /// Embeds to a fixed-length vector derived from the text length.
    struct StubEmbedder;

    impl Embedder for StubEmbedder {
        fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, ServiceResult<Vec<f32>>> {
            let len = text.len() as f32;
            Box::pin(async move { Ok(vec![len, 1.0]) })
        }
    }

    fn analysis_with_paragraphs(paragraphs: &[(&str, u32, u64)]) -> RawAnalysis {
        RawAnalysis {
            pages: vec![AnalyzedPage {
                page_number: 1,
                width: 8.5,
                height: 11.0,
                unit: "inch".to_string(),
                angle: 0.0,
            }],
            paragraphs: paragraphs
                .iter()
                .map(|(content, page, offset)| AnalyzedParagraph {
                    content: content.to_string(),
                    role: None,
                    bounding_regions: vec![BoundingRegion {
                        page_number: *page,
                        polygon: vec![0.0; 8],
                    }],
                    spans: vec![AnalyzedSpan {
                        offset: *offset,
                        length: content.len() as u64,
                    }],
                })
                .collect(),
            tables: vec![],
        }
    }

    struct Fixture {
        db: Arc<Database>,
        store: Arc<MemoryArtifactStore>,
        index: Arc<InMemoryVectorIndex>,
        orchestrator: PipelineOrchestrator,
    }

    fn fixture(transport: Arc<ScriptedTransport>) -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Arc::new(MemoryArtifactStore::new());
        let index = Arc::new(InMemoryVectorIndex::new());

        let converter = Arc::new(Converter::new(&ConversionConfig {
            soffice_path: "/usr/bin/soffice".to_string(),
            timeout_secs: 1,
            attempts: 1,
            retry_delay_secs: 0,
        }));
        let analyzer = DocumentAnalyzer::new(transport, 3, Duration::from_millis(1));
        let parser = Arc::new(DocumentParser::new(analyzer, None));

        let store_dyn: Arc<dyn ArtifactStore> = store.clone();
        let registry = StageRegistry::new()
            .register(Arc::new(ConversionStage::new(
                db.clone(),
                store_dyn.clone(),
                converter,
            )))
            .register(Arc::new(ParsingStage::new(
                db.clone(),
                store_dyn.clone(),
                parser,
            )))
            .register(Arc::new(ChunkingStage::new(
                db.clone(),
                store_dyn.clone(),
                Arc::new(SectionChunker::new(50)),
                index.clone(),
            )))
            .register(Arc::new(EmbeddingStage::new(
                db.clone(),
                store_dyn,
                Arc::new(StubEmbedder),
                index.clone(),
            )));

        let dispatcher = Arc::new(StageDispatcher::new(
            db.clone(),
            registry,
            3,
            Duration::from_millis(1),
            4,
        ));
        let orchestrator = PipelineOrchestrator::new(db.clone(), dispatcher);

        Fixture {
            db,
            store,
            index,
            orchestrator,
        }
    }

    async fn seed_pdf(fixture: &Fixture, id: &str) {
        let doc = sample_document(id, "report.pdf");
        fixture.db.insert_document(&doc).unwrap();
        fixture
            .store
            .upload(&doc.raw_path, b"%PDF-1.7 fake", "application/pdf")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pdf_reaches_ready_with_artifacts_and_vectors() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(analysis_with_paragraphs(
            &[("Opening paragraph.", 1, 0), ("Closing paragraph.", 1, 50)],
        ))]));
        let f = fixture(transport);
        seed_pdf(&f, "doc-1").await;

        f.orchestrator.run("doc-1").unwrap().wait().await;

        let doc = f.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
        assert!(!doc.is_converted);
        assert!(doc.conversion_started_at.is_some());
        assert!(doc.conversion_completed_at.is_some());
        assert!(doc.parsing_completed_at.is_some());
        assert!(doc.chunking_completed_at.is_some());
        assert!(doc.embedding_completed_at.is_some());
        assert_eq!(doc.total_chunks, 1);

        // Enriched envelope landed at its deterministic address.
        let enriched = artifact_path("org-1", "proj-1", "doc-1", ArtifactKind::Enriched, "enriched.json");
        assert_eq!(doc.enriched_path.as_deref(), Some(enriched.as_str()));
        assert!(f.store.addresses().contains(&enriched));
        let envelope: serde_json::Value =
            serde_json::from_slice(&f.store.download(&enriched).await.unwrap()).unwrap();
        assert_eq!(envelope["metadata"]["parser"], "layout_document");

        // Chunks carry their vector ids and the index holds the vectors.
        let chunks = f.db.get_chunks("doc-1").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].vector_id.as_deref(), Some("doc-1:0"));
        assert_eq!(f.index.len("proj-1"), 1);
    }

    #[tokio::test]
    async fn converted_document_parses_the_rendered_pdf() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(analysis_with_paragraphs(
            &[("Letter body.", 1, 0)],
        ))]));
        let f = fixture(transport);

        // Conversion already ran: the rendered PDF, not the original docx,
        // is the parsing input.
        f.db.insert_document(&sample_document("doc-1", "letter.docx"))
            .unwrap();
        let converted = artifact_path("org-1", "proj-1", "doc-1", ArtifactKind::Converted, "letter.pdf");
        f.store
            .upload(&converted, b"%PDF-1.7 rendered", "application/pdf")
            .await
            .unwrap();
        f.db.mark_stage_started("doc-1", Stage::Conversion).unwrap();
        f.db.record_conversion("doc-1", true, Some(&converted)).unwrap();
        f.db.mark_stage_completed("doc-1", Stage::Conversion).unwrap();

        f.orchestrator.run("doc-1").unwrap().wait().await;

        let doc = f.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);

        let envelope: serde_json::Value = serde_json::from_slice(
            &f.store
                .download(doc.enriched_path.as_deref().unwrap())
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(envelope["metadata"]["parser"], "layout_document");
        assert_eq!(envelope["metadata"]["file_name"], "letter.pdf");
    }

    #[tokio::test]
    async fn dispatch_failure_degrades_to_upload_failed() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.insert_document(&sample_document("doc-1", "report.pdf"))
            .unwrap();

        // No runners registered: dispatch itself fails, not a stage.
        let dispatcher = Arc::new(StageDispatcher::new(
            db.clone(),
            StageRegistry::new(),
            1,
            Duration::from_millis(1),
            4,
        ));
        let orchestrator = PipelineOrchestrator::new(db.clone(), dispatcher);

        orchestrator.run("doc-1").unwrap().wait().await;

        let doc = db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::UploadFailed);
        assert!(doc.error_message.is_some());
        // Terminal: the startup resume query no longer picks it up.
        assert!(db.get_unfinished_documents().unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_analysis_failure_leaves_parsing_failed() {
        let bad_json = serde_json::from_str::<RawAnalysis>("not json").unwrap_err();
        let transport = Arc::new(ScriptedTransport::new(vec![Err(
            AnalysisError::InvalidResponse(bad_json),
        )]));
        let f = fixture(transport);
        seed_pdf(&f, "doc-1").await;

        f.orchestrator.run("doc-1").unwrap().wait().await;

        let doc = f.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::ParsingFailed);
        assert!(doc.error_message.is_some());
        // Conversion finished before parsing failed.
        assert!(doc.conversion_completed_at.is_some());
    }

    #[tokio::test]
    async fn failed_document_can_be_retriggered_to_ready() {
        let bad_json = serde_json::from_str::<RawAnalysis>("not json").unwrap_err();
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(AnalysisError::InvalidResponse(bad_json)),
            Ok(analysis_with_paragraphs(&[("Recovered.", 1, 0)])),
        ]));
        let f = fixture(transport);
        seed_pdf(&f, "doc-1").await;

        f.orchestrator.run("doc-1").unwrap().wait().await;
        assert_eq!(
            f.db.get_document("doc-1").unwrap().unwrap().status,
            DocumentStatus::ParsingFailed
        );

        f.orchestrator.run("doc-1").unwrap().wait().await;
        let doc = f.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
        assert!(doc.error_message.is_none());
    }

    #[tokio::test]
    async fn rerun_replaces_chunks_and_vectors() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(analysis_with_paragraphs(&[
                (&"a".repeat(300), 1, 0),
                (&"b".repeat(300), 1, 400),
                (&"c".repeat(300), 2, 0),
            ])),
            Ok(analysis_with_paragraphs(&[("short now", 1, 0)])),
        ]));
        let f = fixture(transport);
        seed_pdf(&f, "doc-1").await;

        f.orchestrator.run("doc-1").unwrap().wait().await;
        assert_eq!(f.db.chunk_count("doc-1").unwrap(), 3);

        f.orchestrator.run("doc-1").unwrap().wait().await;
        let doc = f.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
        assert_eq!(doc.total_chunks, 1);
        assert_eq!(f.db.chunk_count("doc-1").unwrap(), 1);
        // Stale vectors and chunk artifacts from the first run are gone.
        assert_eq!(f.index.len("proj-1"), 1);
        let chunk_addresses: Vec<String> = f
            .store
            .addresses()
            .into_iter()
            .filter(|a| a.contains("/chunks/"))
            .collect();
        assert_eq!(chunk_addresses, vec![
            "org-1/proj-1/doc-1/chunks/chunk_0.json".to_string()
        ]);
    }

    #[tokio::test]
    async fn second_trigger_while_running_is_rejected() {
        struct StallingRunner {
            db: Arc<Database>,
        }

        impl StageRunner for StallingRunner {
            fn stage(&self) -> Stage {
                Stage::Conversion
            }

            fn run<'a>(
                &'a self,
                ctx: &'a StageContext,
            ) -> BoxFuture<'a, Result<StageSummary, StageFailure>> {
                Box::pin(async move {
                    self.db
                        .mark_stage_started(&ctx.document_id, Stage::Conversion)
                        .map_err(StageFailure::from)?;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Err(StageFailure::terminal("stalled"))
                })
            }
        }

        let db = Arc::new(Database::open_in_memory().unwrap());
        db.insert_document(&sample_document("doc-1", "report.pdf"))
            .unwrap();
        let registry =
            StageRegistry::new().register(Arc::new(StallingRunner { db: db.clone() }));
        let dispatcher = Arc::new(StageDispatcher::new(
            db.clone(),
            registry,
            1,
            Duration::from_millis(1),
            4,
        ));
        let orchestrator = PipelineOrchestrator::new(db, dispatcher);

        let job = orchestrator.run("doc-1").unwrap();
        let second = orchestrator.run("doc-1");
        assert!(matches!(second, Err(ServiceError::PipelineBusy { .. })));

        job.wait().await;
        assert!(!orchestrator.is_in_flight("doc-1"));
        // After the run finishes the lease is released and a new trigger
        // is accepted again.
        assert!(orchestrator.run("doc-1").is_ok());
    }

    #[tokio::test]
    async fn interrupted_document_resumes_midway() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(
            analysis_with_paragraphs(&[("Resumed content.", 1, 0)]),
        )]));
        let f = fixture(transport.clone());
        seed_pdf(&f, "doc-1").await;

        // Simulate a crash right after conversion completed.
        f.db.mark_stage_started("doc-1", Stage::Conversion).unwrap();
        f.db.record_conversion("doc-1", false, None).unwrap();
        f.db.mark_stage_completed("doc-1", Stage::Conversion).unwrap();

        let handles = f.orchestrator.resume_unfinished().unwrap();
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.wait().await;
        }

        let doc = f.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
        // The resumed run went straight to parsing: one transport call.
        assert_eq!(*transport.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_document_reaches_ready_with_zero_chunks() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(RawAnalysis::default())]));
        let f = fixture(transport);
        seed_pdf(&f, "doc-1").await;

        f.orchestrator.run("doc-1").unwrap().wait().await;

        let doc = f.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
        assert_eq!(doc.total_chunks, 0);
        assert_eq!(f.index.len("proj-1"), 0);
    }

    #[tokio::test]
    async fn unknown_document_is_rejected() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let f = fixture(transport);

        let err = f.orchestrator.run("nope");
        assert!(matches!(err, Err(ServiceError::DocumentNotFound { .. })));
    }

    #[test]
    fn resume_index_covers_every_status() {
        assert_eq!(resume_index(DocumentStatus::Uploaded), Some(0));
        assert_eq!(resume_index(DocumentStatus::ConversionComplete), Some(1));
        assert_eq!(resume_index(DocumentStatus::ChunkingFailed), Some(2));
        assert_eq!(resume_index(DocumentStatus::EmbeddingStarted), Some(3));
        assert_eq!(resume_index(DocumentStatus::EmbeddingComplete), None);
        assert_eq!(resume_index(DocumentStatus::Ready), Some(0));
    }
}
