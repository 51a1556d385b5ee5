//! Document parsing: layout analysis, section extraction, optional
//! enrichment, and the enriched-document envelope.

pub mod envelope;
pub mod normalizer;

use std::path::Path;

use serde_json::json;
use tracing::{info, warn};

use crate::analysis::DocumentAnalyzer;
use crate::enrichment::Enrichment;
use crate::error::StageFailure;
use crate::parsing::envelope::EnrichedDocument;
use crate::parsing::normalizer::{Section, SectionKind};

/// Which parser handles a document, decided from its filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    /// Paged documents with paragraphs and tables (PDF)
    LayoutDocument,
    /// Workbooks, parsed as tables per sheet
    Spreadsheet,
    /// Presentations, parsed slide by slide
    SlideDeck,
}

impl ParserKind {
    /// Pick a parser for the file the analyzer will receive. By this point
    /// anything convertible has already been rendered to PDF, so an
    /// unsupported extension is a permanent failure.
    pub fn classify(filename: &str) -> Result<Self, StageFailure> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => Ok(ParserKind::LayoutDocument),
            "xlsx" | "xls" => Ok(ParserKind::Spreadsheet),
            "pptx" | "ppt" => Ok(ParserKind::SlideDeck),
            other => Err(StageFailure::terminal(format!(
                "no parser for file type '{other}' ({filename})"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ParserKind::LayoutDocument => "layout_document",
            ParserKind::Spreadsheet => "spreadsheet",
            ParserKind::SlideDeck => "slide_deck",
        }
    }
}

/// Parses analyzable bytes into an [`EnrichedDocument`] envelope.
pub struct DocumentParser {
    analyzer: DocumentAnalyzer,
    enrichment: Option<Enrichment>,
}

impl DocumentParser {
    pub fn new(analyzer: DocumentAnalyzer, enrichment: Option<Enrichment>) -> Self {
        Self {
            analyzer,
            enrichment,
        }
    }

    /// Analyze, normalize, and (optionally) enrich a document.
    pub async fn parse(
        &self,
        kind: ParserKind,
        content: &[u8],
        filename: &str,
        document_id: &str,
    ) -> Result<EnrichedDocument, StageFailure> {
        let raw = self.analyzer.analyze(content).await?;
        let (sections, page_info) = normalizer::extract(&raw);

        info!(
            document_id = %document_id,
            filename = %filename,
            parser = kind.name(),
            sections = sections.len(),
            pages = page_info.len(),
            "Document parsed"
        );

        let mut metadata = serde_json::Map::new();
        metadata.insert("document_id".to_string(), json!(document_id));
        metadata.insert("file_name".to_string(), json!(filename));
        metadata.insert("file_size".to_string(), json!(content.len()));
        metadata.insert("parser".to_string(), json!(kind.name()));
        metadata.insert("parsing_service".to_string(), json!(env!("CARGO_PKG_NAME")));
        metadata.insert("created_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
        metadata.insert("total_sections".to_string(), json!(sections.len()));
        match kind {
            ParserKind::LayoutDocument => {
                metadata.insert("total_pages".to_string(), json!(page_info.len()));
            }
            ParserKind::Spreadsheet => {
                metadata.insert("total_tables".to_string(), json!(raw.tables.len()));
                metadata.insert("file_type".to_string(), json!("spreadsheet"));
            }
            ParserKind::SlideDeck => {
                metadata.insert("total_slides".to_string(), json!(page_info.len()));
            }
        }
        let metadata = serde_json::Value::Object(metadata);

        let enriched_metadata = match &self.enrichment {
            Some(enrichment) => {
                let text = enrichment_text(&sections);
                match enrichment.enrich(&text, filename).await {
                    Some(metadata) => match serde_json::to_value(&metadata) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            warn!(error = %e, "Could not serialize enriched metadata");
                            None
                        }
                    },
                    None => None,
                }
            }
            None => None,
        };

        Ok(EnrichedDocument::new(
            sections,
            page_info,
            enriched_metadata,
            metadata,
        ))
    }
}

/// Text handed to the enrichment model: section content in reading order.
/// Tables are skipped; their HTML markup wastes the excerpt budget without
/// telling the model anything about the document.
fn enrichment_text(sections: &[Section]) -> String {
    sections
        .iter()
        .filter(|s| s.kind != SectionKind::Table)
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
