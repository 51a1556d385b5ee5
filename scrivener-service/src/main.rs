use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

mod analysis;
mod api;
mod config;
mod conversion;
mod db;
mod enrichment;
mod error;
mod parsing;
mod pipeline;
mod storage;
mod vector;

use crate::analysis::{DocumentAnalyzer, HttpAnalysisTransport};
use crate::config::ServiceConfig;
use crate::conversion::Converter;
use crate::db::Database;
use crate::enrichment::{Enrichment, LlmClient};
use crate::parsing::DocumentParser;
use crate::pipeline::PipelineOrchestrator;
use crate::pipeline::chunking::{ChunkingStage, SectionChunker};
use crate::pipeline::conversion::ConversionStage;
use crate::pipeline::dispatcher::{StageDispatcher, StageRegistry};
use crate::pipeline::embedding::EmbeddingStage;
use crate::pipeline::parsing::ParsingStage;
use crate::storage::{ArtifactStore, LocalArtifactStore};
use crate::vector::InMemoryVectorIndex;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!(
        "Starting Scrivener document pipeline service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = ServiceConfig::load()?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.storage.data_dir)?;

    let db_path = config.storage.data_dir.join("scrivener.db");
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Database initialized");

    let store: Arc<dyn ArtifactStore> = Arc::new(LocalArtifactStore::new(
        config.storage.data_dir.join("artifacts"),
    ));

    let converter = Arc::new(Converter::new(&config.conversion));

    let transport = Arc::new(HttpAnalysisTransport::new(&config.analysis)?);
    let analyzer = DocumentAnalyzer::new(
        transport,
        config.analysis.attempts,
        Duration::from_secs(config.analysis.retry_delay_secs),
    );

    let enrichment = if config.enrichment.enabled {
        info!(
            base_url = %config.enrichment.base_url,
            model = %config.enrichment.chat_model,
            "Metadata enrichment enabled"
        );
        Some(Enrichment::new(LlmClient::new(&config.enrichment)?))
    } else {
        None
    };
    let parser = Arc::new(DocumentParser::new(analyzer, enrichment));

    // Embeddings go through the same LLM endpoint regardless of whether
    // chat-based enrichment is turned on.
    let embedder = Arc::new(LlmClient::new(&config.enrichment)?);
    let index: Arc<InMemoryVectorIndex> = Arc::new(InMemoryVectorIndex::new());

    let registry = StageRegistry::new()
        .register(Arc::new(ConversionStage::new(
            db.clone(),
            store.clone(),
            converter,
        )))
        .register(Arc::new(ParsingStage::new(
            db.clone(),
            store.clone(),
            parser,
        )))
        .register(Arc::new(ChunkingStage::new(
            db.clone(),
            store.clone(),
            Arc::new(SectionChunker::new(config.pipeline.chunk_max_tokens)),
            index.clone(),
        )))
        .register(Arc::new(EmbeddingStage::new(
            db.clone(),
            store.clone(),
            embedder,
            index,
        )));

    let dispatcher = Arc::new(StageDispatcher::new(
        db.clone(),
        registry,
        config.pipeline.max_attempts,
        Duration::from_secs(config.pipeline.retry_delay_secs),
        config.pipeline.max_concurrent_stages,
    ));
    let orchestrator = Arc::new(PipelineOrchestrator::new(db.clone(), dispatcher));

    // Pick up documents whose pipeline a previous process left unfinished.
    let resumed = orchestrator.resume_unfinished()?;
    if !resumed.is_empty() {
        info!(count = resumed.len(), "Resumed interrupted documents");
    }

    let app = api::router(db, store, orchestrator);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("scrivener_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
