//! Chunk persistence.
//!
//! Chunking is re-run-safe: `replace_chunks` swaps the whole chunk set for a
//! document in one transaction, so a retried chunking stage replaces rather
//! than appends.

use rusqlite::params;

use super::Database;
use super::models::Chunk;
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Replace the full chunk set for a document.
    pub fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> ServiceResult<()> {
        let mut conn = self.conn.lock().unwrap();

        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        tx.execute(
            "DELETE FROM chunks WHERE document_id = ?1",
            params![document_id],
        )
        .map_err(DatabaseError::Query)?;

        for chunk in chunks {
            let metadata_json = chunk
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(DatabaseError::Serialization)?;

            tx.execute(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, token_count, storage_path,
                    vector_id, metadata, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    chunk.id,
                    chunk.document_id,
                    chunk.chunk_index as i64,
                    chunk.token_count as i64,
                    chunk.storage_path,
                    chunk.vector_id,
                    metadata_json,
                    chunk.created_at.to_rfc3339(),
                ],
            )
            .map_err(DatabaseError::Query)?;
        }

        tx.commit().map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// All chunks for a document in reading order.
    pub fn get_chunks(&self, document_id: &str) -> ServiceResult<Vec<Chunk>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT id, document_id, chunk_index, token_count, storage_path, vector_id, \
                 metadata, created_at FROM chunks WHERE document_id = ?1 ORDER BY chunk_index",
            )
            .map_err(DatabaseError::Query)?;

        let chunks: Vec<Chunk> = stmt
            .query_map(params![document_id], |row| Chunk::from_row(row))
            .map_err(DatabaseError::Query)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(chunks)
    }

    /// Number of chunks currently stored for a document.
    pub fn chunk_count(&self, document_id: &str) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
                params![document_id],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Query)?;

        Ok(count as usize)
    }

    /// Assign the vector identifier once embedding has upserted the chunk.
    pub fn set_chunk_vector_id(&self, chunk_id: &str, vector_id: &str) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "UPDATE chunks SET vector_id = ?1 WHERE id = ?2",
            params![vector_id, chunk_id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::db::test_support::sample_document;

    fn chunk(document_id: &str, index: u32) -> Chunk {
        Chunk {
            id: format!("{document_id}-chunk-{index}"),
            document_id: document_id.to_string(),
            chunk_index: index,
            token_count: 50,
            storage_path: format!("org/proj/{document_id}/chunks/chunk_{index}.json"),
            vector_id: None,
            metadata: Some(serde_json::json!({ "page": index + 1 })),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn replace_chunks_replaces_not_appends() {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(&sample_document("doc-1", "report.pdf"))
            .unwrap();

        db.replace_chunks("doc-1", &[chunk("doc-1", 0), chunk("doc-1", 1), chunk("doc-1", 2)])
            .unwrap();
        assert_eq!(db.chunk_count("doc-1").unwrap(), 3);

        // Re-run with a smaller set; nothing from the first run survives.
        db.replace_chunks("doc-1", &[chunk("doc-1", 0), chunk("doc-1", 1)])
            .unwrap();
        let chunks = db.get_chunks("doc-1").unwrap();
        assert_eq!(chunks.len(), 2);
        let indexes: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[test]
    fn vector_id_assignment() {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(&sample_document("doc-1", "report.pdf"))
            .unwrap();
        db.replace_chunks("doc-1", &[chunk("doc-1", 0)]).unwrap();

        db.set_chunk_vector_id("doc-1-chunk-0", "doc-1:0").unwrap();
        let chunks = db.get_chunks("doc-1").unwrap();
        assert_eq!(chunks[0].vector_id.as_deref(), Some("doc-1:0"));
    }
}
