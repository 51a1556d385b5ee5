//! Database model structs.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::pipeline::state::{DocumentStatus, Stage};

/// Document record. One row per uploaded file, mutated only by the stage that
/// owns the corresponding status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub organization_id: String,
    pub project_id: String,
    pub name: String,
    pub original_filename: String,
    pub size: u64,
    pub media_type: String,
    pub status: DocumentStatus,
    /// Address of the raw upload in the artifact store
    pub raw_path: String,
    pub is_converted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converted_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enriched_path: Option<String>,
    pub total_chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsing_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsing_completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunking_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunking_completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Enriched metadata extracted during parsing, if enrichment ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-stage timing and failure view derived from the document's own fields.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Document {
    /// Stage timing view. Always reflects the document's timestamp columns;
    /// the failure message is only attributed to the stage that failed.
    pub fn stage_record(&self, stage: Stage) -> StageRecord {
        let (started_at, completed_at) = match stage {
            Stage::Conversion => (self.conversion_started_at, self.conversion_completed_at),
            Stage::Parsing => (self.parsing_started_at, self.parsing_completed_at),
            Stage::Chunking => (self.chunking_started_at, self.chunking_completed_at),
            Stage::Embedding => (self.embedding_started_at, self.embedding_completed_at),
        };
        let failure = if self.status == stage.failed() {
            self.error_message.clone()
        } else {
            None
        };
        StageRecord {
            stage,
            started_at,
            completed_at,
            failure,
        }
    }

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let status_str: String = row.get(7)?;
        let size: i64 = row.get(5)?;
        let total_chunks: i64 = row.get(11)?;
        let metadata_str: Option<String> = row.get(21)?;

        Ok(Self {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            project_id: row.get(2)?,
            name: row.get(3)?,
            original_filename: row.get(4)?,
            size: size as u64,
            media_type: row.get(6)?,
            status: DocumentStatus::parse(&status_str).unwrap_or(DocumentStatus::UploadFailed),
            raw_path: row.get(8)?,
            is_converted: row.get(9)?,
            converted_path: row.get(10)?,
            total_chunks: total_chunks as usize,
            conversion_started_at: parse_ts(row.get::<_, Option<String>>(12)?),
            conversion_completed_at: parse_ts(row.get::<_, Option<String>>(13)?),
            parsing_started_at: parse_ts(row.get::<_, Option<String>>(14)?),
            parsing_completed_at: parse_ts(row.get::<_, Option<String>>(15)?),
            chunking_started_at: parse_ts(row.get::<_, Option<String>>(16)?),
            chunking_completed_at: parse_ts(row.get::<_, Option<String>>(17)?),
            embedding_started_at: parse_ts(row.get::<_, Option<String>>(18)?),
            embedding_completed_at: parse_ts(row.get::<_, Option<String>>(19)?),
            error_message: row.get(20)?,
            document_metadata: metadata_str.and_then(|s| serde_json::from_str(&s).ok()),
            enriched_path: row.get(22)?,
            created_at: parse_ts(row.get::<_, Option<String>>(23)?).unwrap_or_else(Utc::now),
            updated_at: parse_ts(row.get::<_, Option<String>>(24)?).unwrap_or_else(Utc::now),
        })
    }
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Chunk record. Chunk text lives in the artifact store at `storage_path`,
/// not in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// 0-based, dense within a document
    pub chunk_index: u32,
    pub token_count: u32,
    pub storage_path: String,
    /// Identifier in the vector index; null until embedding completes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let chunk_index: i64 = row.get(2)?;
        let token_count: i64 = row.get(3)?;
        let metadata_str: Option<String> = row.get(6)?;
        let created_at_str: String = row.get(7)?;

        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            chunk_index: chunk_index as u32,
            token_count: token_count as u32,
            storage_path: row.get(4)?,
            vector_id: row.get(5)?,
            metadata: metadata_str.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}
