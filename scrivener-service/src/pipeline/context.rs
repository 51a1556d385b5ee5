//! Per-document context handed to every stage runner.

use crate::db::Document;

/// Identity a stage needs to locate the document and address its artifacts.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub document_id: String,
    pub organization_id: String,
    pub project_id: String,
}

impl StageContext {
    pub fn for_document(document: &Document) -> Self {
        Self {
            document_id: document.id.clone(),
            organization_id: document.organization_id.clone(),
            project_id: document.project_id.clone(),
        }
    }
}
