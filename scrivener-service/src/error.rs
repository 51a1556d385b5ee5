use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::state::{Stage, StateError};

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    #[error("Pipeline already running for document: {document_id}")]
    PipelineBusy { document_id: String },

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("{0}")]
    State(#[from] StateError),

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Stage(#[from] StageError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),
}

/// Artifact store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Artifact not found: {address}")]
    NotFound { address: String },

    #[error("Invalid artifact address: {address}")]
    InvalidAddress { address: String },

    #[error("IO error for artifact {address}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// Missing or malformed addresses are permanent; IO trouble is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Io { .. })
    }
}

/// Layout-analysis call errors
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Analysis request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Analysis service rate limited the request")]
    RateLimited,

    #[error("Analysis request failed (status {status}): {message}")]
    Http { status: u16, message: String },

    #[error("Connection failed to analysis service at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid response from analysis service")]
    InvalidResponse(#[source] serde_json::Error),

    #[error("Analysis failed after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },
}

/// LLM enrichment / embedding call errors
#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("Connection failed to LLM at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("LLM request failed (status {status}): {message}")]
    Generation { status: u16, message: String },

    #[error("Invalid response from LLM")]
    InvalidResponse(#[source] serde_json::Error),
}

/// File conversion errors
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("Converter not found at {path}")]
    ConverterMissing { path: String },

    #[error("Conversion timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Converter exited with failure: {message}")]
    ConverterFailed { message: String },

    #[error("Converter produced no output file")]
    NoOutput,

    #[error("Spreadsheet pre-processing failed: {message}")]
    Preprocess { message: String },

    #[error("IO error during conversion")]
    Io(#[source] std::io::Error),
}

impl ConversionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            // A missing binary or a workbook the preprocessor cannot read
            // will not fix itself between attempts.
            ConversionError::ConverterMissing { .. } | ConversionError::Preprocess { .. } => false,
            ConversionError::Timeout { .. }
            | ConversionError::ConverterFailed { .. }
            | ConversionError::NoOutput
            | ConversionError::Io(_) => true,
        }
    }
}

/// Stage-level failure taxonomy, one variant per pipeline stage. The message
/// is persisted on the document's `error_message` field.
#[derive(Error, Debug, Clone)]
pub enum StageError {
    #[error("Upload failed: {message}")]
    UploadFailed { message: String },

    #[error("Conversion failed: {message}")]
    ConversionFailed { message: String },

    #[error("Parsing failed: {message}")]
    ParsingFailed { message: String },

    #[error("Chunking failed: {message}")]
    ChunkingFailed { message: String },

    #[error("Embedding failed: {message}")]
    EmbeddingFailed { message: String },
}

impl StageError {
    pub fn for_stage(stage: Stage, message: impl Into<String>) -> Self {
        let message = message.into();
        match stage {
            Stage::Conversion => StageError::ConversionFailed { message },
            Stage::Parsing => StageError::ParsingFailed { message },
            Stage::Chunking => StageError::ChunkingFailed { message },
            Stage::Embedding => StageError::EmbeddingFailed { message },
        }
    }
}

/// Error raised inside a stage runner. `retryable` drives the dispatcher's
/// attempt budget; terminal failures skip the remaining attempts.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct StageFailure {
    pub message: String,
    pub retryable: bool,
}

impl StageFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<StorageError> for StageFailure {
    fn from(e: StorageError) -> Self {
        Self {
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }
}

impl From<ConversionError> for StageFailure {
    fn from(e: ConversionError) -> Self {
        Self {
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }
}

impl From<AnalysisError> for StageFailure {
    fn from(e: AnalysisError) -> Self {
        // The analyzer has already burned its own retry budget; trying the
        // whole stage again still makes sense for transient service trouble.
        Self {
            retryable: !matches!(e, AnalysisError::InvalidResponse(_)),
            message: e.to_string(),
        }
    }
}

impl From<ServiceError> for StageFailure {
    fn from(e: ServiceError) -> Self {
        let retryable = match &e {
            ServiceError::Database(_) => true,
            ServiceError::Storage(s) => s.is_retryable(),
            // Illegal transitions, missing documents, and bad requests are
            // not going to succeed on a second attempt.
            _ => false,
        };
        Self {
            retryable,
            message: e.to_string(),
        }
    }
}

/// API error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::DocumentNotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::PipelineBusy { .. } => StatusCode::CONFLICT,
            ServiceError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ServiceError::State(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServiceError::DocumentNotFound { .. } => "document_not_found",
            ServiceError::PipelineBusy { .. } => "pipeline_busy",
            ServiceError::Database(_) => "database_error",
            ServiceError::State(_) => "illegal_transition",
            ServiceError::Storage(_) => "storage_error",
            ServiceError::Stage(StageError::UploadFailed { .. }) => "upload_failed",
            ServiceError::Stage(StageError::ConversionFailed { .. }) => "conversion_failed",
            ServiceError::Stage(StageError::ParsingFailed { .. }) => "parsing_failed",
            ServiceError::Stage(StageError::ChunkingFailed { .. }) => "chunking_failed",
            ServiceError::Stage(StageError::EmbeddingFailed { .. }) => "embedding_failed",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code().to_string();

        let response = ErrorResponse {
            message: self.to_string(),
            code: Some(code),
        };

        (status, Json(response)).into_response()
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
