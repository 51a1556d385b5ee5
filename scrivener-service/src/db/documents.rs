//! Document persistence and status transitions.
//!
//! Every status update is validated against the lifecycle state machine
//! before it is written, under the same connection lock that performs the
//! write, so a persisted status can never skip a transition.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::Database;
use super::models::Document;
use crate::error::{DatabaseError, ServiceError, ServiceResult};
use crate::pipeline::state::{DocumentStatus, Stage, validate_transition};

const DOCUMENT_COLUMNS: &str = "id, organization_id, project_id, name, original_filename, size, \
     media_type, status, raw_path, is_converted, converted_path, total_chunks, \
     conversion_started_at, conversion_completed_at, parsing_started_at, parsing_completed_at, \
     chunking_started_at, chunking_completed_at, embedding_started_at, embedding_completed_at, \
     error_message, document_metadata, enriched_path, created_at, updated_at";

impl Database {
    /// Insert a new document
    pub fn insert_document(&self, doc: &Document) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        let metadata_json = doc
            .document_metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(DatabaseError::Serialization)?;

        conn.execute(
            r#"
            INSERT INTO documents (id, organization_id, project_id, name, original_filename, size,
                media_type, status, raw_path, is_converted, converted_path, total_chunks,
                error_message, document_metadata, enriched_path, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            params![
                doc.id,
                doc.organization_id,
                doc.project_id,
                doc.name,
                doc.original_filename,
                doc.size as i64,
                doc.media_type,
                doc.status.as_str(),
                doc.raw_path,
                doc.is_converted,
                doc.converted_path,
                doc.total_chunks as i64,
                doc.error_message,
                metadata_json,
                doc.enriched_path,
                doc.created_at.to_rfc3339(),
                doc.updated_at.to_rfc3339(),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Get a document by ID
    pub fn get_document(&self, id: &str) -> ServiceResult<Option<Document>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
            params![id],
            |row| Document::from_row(row),
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(ServiceError::from)
    }

    /// Documents whose pipeline was interrupted: anything in a non-terminal,
    /// non-ready state. Used on startup to resume work after a restart.
    pub fn get_unfinished_documents(&self) -> ServiceResult<Vec<Document>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents \
                 WHERE status NOT IN ('ready', 'upload_failed', 'conversion_failed', \
                       'parsing_failed', 'chunking_failed', 'embedding_failed', 'uploading') \
                 ORDER BY created_at"
            ))
            .map_err(DatabaseError::Query)?;

        let docs: Vec<Document> = stmt
            .query_map([], |row| Document::from_row(row))
            .map_err(DatabaseError::Query)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(docs)
    }

    /// Validated status update. Returns `ServiceError::State` if the
    /// transition is illegal for the document's current status.
    pub fn update_status(&self, id: &str, to: DocumentStatus) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::transition_locked(&conn, id, to, None)
    }

    /// Mark a stage started: validated transition plus started-at timestamp.
    /// Clears any previous error message for the new attempt.
    pub fn mark_stage_started(&self, id: &str, stage: Stage) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::transition_locked(&conn, id, stage.started(), None)?;

        conn.execute(
            &format!(
                "UPDATE documents SET {}_started_at = ?1, {}_completed_at = NULL, \
                 error_message = NULL, updated_at = ?1 WHERE id = ?2",
                stage.name(),
                stage.name()
            ),
            params![Utc::now().to_rfc3339(), id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Mark a stage completed: validated transition plus completed-at timestamp.
    pub fn mark_stage_completed(&self, id: &str, stage: Stage) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::transition_locked(&conn, id, stage.complete(), None)?;

        conn.execute(
            &format!(
                "UPDATE documents SET {}_completed_at = ?1, updated_at = ?1 WHERE id = ?2",
                stage.name()
            ),
            params![Utc::now().to_rfc3339(), id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Mark a stage failed with the error message persisted on the document.
    pub fn mark_stage_failed(&self, id: &str, stage: Stage, message: &str) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::transition_locked(&conn, id, stage.failed(), Some(message))
    }

    /// The orchestrator's coarse fallback: reachable from any state.
    pub fn mark_upload_failed(&self, id: &str, message: &str) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::transition_locked(&conn, id, DocumentStatus::UploadFailed, Some(message))
    }

    /// Record the conversion outcome on the document.
    pub fn record_conversion(
        &self,
        id: &str,
        is_converted: bool,
        converted_path: Option<&str>,
    ) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "UPDATE documents SET is_converted = ?1, converted_path = ?2, updated_at = ?3 \
             WHERE id = ?4",
            params![is_converted, converted_path, Utc::now().to_rfc3339(), id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Record the parsing outcome: enriched artifact address and, when
    /// enrichment ran, the extracted metadata for easy querying.
    pub fn record_parsing_result(
        &self,
        id: &str,
        enriched_path: &str,
        document_metadata: Option<&serde_json::Value>,
    ) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        let metadata_json = document_metadata
            .map(serde_json::to_string)
            .transpose()
            .map_err(DatabaseError::Serialization)?;

        conn.execute(
            "UPDATE documents SET enriched_path = ?1, document_metadata = ?2, updated_at = ?3 \
             WHERE id = ?4",
            params![enriched_path, metadata_json, Utc::now().to_rfc3339(), id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Record the chunk total after chunking replaces the chunk set.
    pub fn record_chunk_total(&self, id: &str, total: usize) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "UPDATE documents SET total_chunks = ?1, updated_at = ?2 WHERE id = ?3",
            params![total as i64, Utc::now().to_rfc3339(), id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    fn transition_locked(
        conn: &rusqlite::Connection,
        id: &str,
        to: DocumentStatus,
        error_message: Option<&str>,
    ) -> ServiceResult<()> {
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM documents WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let current = current.ok_or_else(|| ServiceError::DocumentNotFound {
            document_id: id.to_string(),
        })?;
        let from = DocumentStatus::parse(&current).ok_or_else(|| ServiceError::Internal {
            message: format!("document {id} has unknown status '{current}'"),
        })?;

        validate_transition(from, to)?;

        conn.execute(
            "UPDATE documents SET status = ?1, error_message = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                to.as_str(),
                error_message,
                Utc::now().to_rfc3339(),
                id
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::sample_document;

    #[test]
    fn insert_and_get_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let doc = sample_document("doc-1", "report.pdf");
        db.insert_document(&doc).unwrap();

        let loaded = db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(loaded.original_filename, "report.pdf");
        assert_eq!(loaded.status, DocumentStatus::Uploaded);
        assert_eq!(loaded.total_chunks, 0);
        assert!(db.get_document("missing").unwrap().is_none());
    }

    #[test]
    fn stage_lifecycle_updates_timestamps() {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(&sample_document("doc-1", "report.pdf"))
            .unwrap();

        db.mark_stage_started("doc-1", Stage::Conversion).unwrap();
        let doc = db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::ConversionStarted);
        assert!(doc.conversion_started_at.is_some());
        assert!(doc.conversion_completed_at.is_none());

        db.mark_stage_completed("doc-1", Stage::Conversion).unwrap();
        let doc = db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::ConversionComplete);
        assert!(doc.conversion_completed_at.is_some());

        let record = doc.stage_record(Stage::Conversion);
        assert_eq!(record.started_at, doc.conversion_started_at);
        assert_eq!(record.completed_at, doc.conversion_completed_at);
        assert!(record.failure.is_none());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(&sample_document("doc-1", "report.pdf"))
            .unwrap();

        // Completing a stage that was never started
        let err = db.mark_stage_completed("doc-1", Stage::Conversion);
        assert!(matches!(err, Err(ServiceError::State(_))));

        // Skipping ahead
        let err = db.mark_stage_started("doc-1", Stage::Chunking);
        assert!(matches!(err, Err(ServiceError::State(_))));
    }

    #[test]
    fn stage_failure_persists_message() {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(&sample_document("doc-1", "report.pdf"))
            .unwrap();

        db.mark_stage_started("doc-1", Stage::Conversion).unwrap();
        db.mark_stage_failed("doc-1", Stage::Conversion, "soffice timed out")
            .unwrap();

        let doc = db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::ConversionFailed);
        assert_eq!(doc.error_message.as_deref(), Some("soffice timed out"));
        assert_eq!(
            doc.stage_record(Stage::Conversion).failure.as_deref(),
            Some("soffice timed out")
        );

        // Re-trigger clears the message for the new attempt
        db.mark_stage_started("doc-1", Stage::Conversion).unwrap();
        let doc = db.get_document("doc-1").unwrap().unwrap();
        assert!(doc.error_message.is_none());
    }

    #[test]
    fn unfinished_documents_excludes_terminal_states() {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(&sample_document("a", "a.pdf")).unwrap();
        db.insert_document(&sample_document("b", "b.pdf")).unwrap();

        db.mark_stage_started("b", Stage::Conversion).unwrap();
        db.mark_stage_failed("b", Stage::Conversion, "boom").unwrap();

        let unfinished = db.get_unfinished_documents().unwrap();
        let ids: Vec<&str> = unfinished.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }
}
