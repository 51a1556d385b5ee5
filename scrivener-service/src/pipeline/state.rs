//! Document lifecycle state machine.
//!
//! Pure transition validation; no I/O happens here. The database layer calls
//! [`validate_transition`] before persisting any status change, so a stage can
//! never record completion for work it did not start.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Processing lifecycle status for documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploading,
    Uploaded,
    UploadFailed,
    ConversionStarted,
    ConversionComplete,
    ConversionFailed,
    ParsingStarted,
    ParsingComplete,
    ParsingFailed,
    ChunkingStarted,
    ChunkingComplete,
    ChunkingFailed,
    EmbeddingStarted,
    EmbeddingComplete,
    EmbeddingFailed,
    Ready,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploading => "uploading",
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::UploadFailed => "upload_failed",
            DocumentStatus::ConversionStarted => "conversion_started",
            DocumentStatus::ConversionComplete => "conversion_complete",
            DocumentStatus::ConversionFailed => "conversion_failed",
            DocumentStatus::ParsingStarted => "parsing_started",
            DocumentStatus::ParsingComplete => "parsing_complete",
            DocumentStatus::ParsingFailed => "parsing_failed",
            DocumentStatus::ChunkingStarted => "chunking_started",
            DocumentStatus::ChunkingComplete => "chunking_complete",
            DocumentStatus::ChunkingFailed => "chunking_failed",
            DocumentStatus::EmbeddingStarted => "embedding_started",
            DocumentStatus::EmbeddingComplete => "embedding_complete",
            DocumentStatus::EmbeddingFailed => "embedding_failed",
            DocumentStatus::Ready => "ready",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "uploading" => DocumentStatus::Uploading,
            "uploaded" => DocumentStatus::Uploaded,
            "upload_failed" => DocumentStatus::UploadFailed,
            "conversion_started" => DocumentStatus::ConversionStarted,
            "conversion_complete" => DocumentStatus::ConversionComplete,
            "conversion_failed" => DocumentStatus::ConversionFailed,
            "parsing_started" => DocumentStatus::ParsingStarted,
            "parsing_complete" => DocumentStatus::ParsingComplete,
            "parsing_failed" => DocumentStatus::ParsingFailed,
            "chunking_started" => DocumentStatus::ChunkingStarted,
            "chunking_complete" => DocumentStatus::ChunkingComplete,
            "chunking_failed" => DocumentStatus::ChunkingFailed,
            "embedding_started" => DocumentStatus::EmbeddingStarted,
            "embedding_complete" => DocumentStatus::EmbeddingComplete,
            "embedding_failed" => DocumentStatus::EmbeddingFailed,
            "ready" => DocumentStatus::Ready,
            _ => return None,
        })
    }

    /// Terminal states: either retrieval-ready or failed with no automatic
    /// route forward. Recovery from a failed state is an external re-trigger.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Ready
                | DocumentStatus::UploadFailed
                | DocumentStatus::ConversionFailed
                | DocumentStatus::ParsingFailed
                | DocumentStatus::ChunkingFailed
                | DocumentStatus::EmbeddingFailed
        )
    }

    /// Position along the pipeline. Failed states rank with their started
    /// state so a re-trigger may begin the same stage again.
    fn rank(&self) -> u8 {
        match self {
            DocumentStatus::Uploading => 0,
            DocumentStatus::Uploaded | DocumentStatus::UploadFailed => 1,
            DocumentStatus::ConversionStarted | DocumentStatus::ConversionFailed => 2,
            DocumentStatus::ConversionComplete => 3,
            DocumentStatus::ParsingStarted | DocumentStatus::ParsingFailed => 4,
            DocumentStatus::ParsingComplete => 5,
            DocumentStatus::ChunkingStarted | DocumentStatus::ChunkingFailed => 6,
            DocumentStatus::ChunkingComplete => 7,
            DocumentStatus::EmbeddingStarted | DocumentStatus::EmbeddingFailed => 8,
            DocumentStatus::EmbeddingComplete => 9,
            DocumentStatus::Ready => 10,
        }
    }
}

/// One named step in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Conversion,
    Parsing,
    Chunking,
    Embedding,
}

/// The order stages run in for every document.
pub const STAGE_SEQUENCE: [Stage; 4] = [
    Stage::Conversion,
    Stage::Parsing,
    Stage::Chunking,
    Stage::Embedding,
];

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Conversion => "conversion",
            Stage::Parsing => "parsing",
            Stage::Chunking => "chunking",
            Stage::Embedding => "embedding",
        }
    }

    pub fn started(&self) -> DocumentStatus {
        match self {
            Stage::Conversion => DocumentStatus::ConversionStarted,
            Stage::Parsing => DocumentStatus::ParsingStarted,
            Stage::Chunking => DocumentStatus::ChunkingStarted,
            Stage::Embedding => DocumentStatus::EmbeddingStarted,
        }
    }

    pub fn complete(&self) -> DocumentStatus {
        match self {
            Stage::Conversion => DocumentStatus::ConversionComplete,
            Stage::Parsing => DocumentStatus::ParsingComplete,
            Stage::Chunking => DocumentStatus::ChunkingComplete,
            Stage::Embedding => DocumentStatus::EmbeddingComplete,
        }
    }

    pub fn failed(&self) -> DocumentStatus {
        match self {
            Stage::Conversion => DocumentStatus::ConversionFailed,
            Stage::Parsing => DocumentStatus::ParsingFailed,
            Stage::Chunking => DocumentStatus::ChunkingFailed,
            Stage::Embedding => DocumentStatus::EmbeddingFailed,
        }
    }

    /// The status a document must have reached before this stage may begin
    /// for the first time.
    pub fn prerequisite(&self) -> DocumentStatus {
        match self {
            Stage::Conversion => DocumentStatus::Uploaded,
            Stage::Parsing => DocumentStatus::ConversionComplete,
            Stage::Chunking => DocumentStatus::ParsingComplete,
            Stage::Embedding => DocumentStatus::ChunkingComplete,
        }
    }

    /// The stage a status belongs to, if any.
    pub fn of_status(status: DocumentStatus) -> Option<Stage> {
        match status {
            DocumentStatus::ConversionStarted
            | DocumentStatus::ConversionComplete
            | DocumentStatus::ConversionFailed => Some(Stage::Conversion),
            DocumentStatus::ParsingStarted
            | DocumentStatus::ParsingComplete
            | DocumentStatus::ParsingFailed => Some(Stage::Parsing),
            DocumentStatus::ChunkingStarted
            | DocumentStatus::ChunkingComplete
            | DocumentStatus::ChunkingFailed => Some(Stage::Chunking),
            DocumentStatus::EmbeddingStarted
            | DocumentStatus::EmbeddingComplete
            | DocumentStatus::EmbeddingFailed => Some(Stage::Embedding),
            _ => None,
        }
    }
}

/// Illegal transition signal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Illegal status transition: {from:?} -> {to:?}")]
pub struct StateError {
    pub from: DocumentStatus,
    pub to: DocumentStatus,
}

/// Validate a status transition.
///
/// Rules:
/// - `uploading -> uploaded`.
/// - `upload_failed` is reachable from any state (the orchestrator's coarse
///   fallback when it cannot even build the stage sequence).
/// - A stage may begin (`*_started`) once the document has reached its
///   predecessor's completion state. Re-triggers are allowed: beginning again
///   from the same stage's started or failed state, or from any later state,
///   is legal. Beginning ahead of the prerequisite is not.
/// - A stage may only complete or fail from its own started state.
/// - `ready` only follows `embedding_complete`.
pub fn validate_transition(from: DocumentStatus, to: DocumentStatus) -> Result<(), StateError> {
    let illegal = StateError { from, to };

    match to {
        DocumentStatus::Uploading => Err(illegal),
        DocumentStatus::Uploaded => {
            if from == DocumentStatus::Uploading {
                Ok(())
            } else {
                Err(illegal)
            }
        }
        DocumentStatus::UploadFailed => Ok(()),
        DocumentStatus::Ready => {
            if from == DocumentStatus::EmbeddingComplete {
                Ok(())
            } else {
                Err(illegal)
            }
        }
        _ => {
            let stage = Stage::of_status(to).ok_or(illegal.clone())?;
            if to == stage.started() {
                if from.rank() >= stage.prerequisite().rank() {
                    Ok(())
                } else {
                    Err(illegal)
                }
            } else {
                // complete or failed
                if from == stage.started() {
                    Ok(())
                } else {
                    Err(illegal)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [
            DocumentStatus::Uploading,
            DocumentStatus::Uploaded,
            DocumentStatus::ConversionStarted,
            DocumentStatus::ConversionComplete,
            DocumentStatus::ParsingStarted,
            DocumentStatus::ParsingComplete,
            DocumentStatus::ChunkingStarted,
            DocumentStatus::ChunkingComplete,
            DocumentStatus::EmbeddingStarted,
            DocumentStatus::EmbeddingComplete,
            DocumentStatus::Ready,
        ];
        for pair in path.windows(2) {
            assert!(
                validate_transition(pair[0], pair[1]).is_ok(),
                "{:?} -> {:?} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn cannot_complete_a_stage_that_never_started() {
        for stage in STAGE_SEQUENCE {
            let err = validate_transition(stage.prerequisite(), stage.complete());
            assert!(err.is_err(), "{:?} completion without start", stage);
        }
    }

    #[test]
    fn cannot_skip_ahead() {
        assert!(
            validate_transition(DocumentStatus::Uploaded, DocumentStatus::ParsingStarted).is_err()
        );
        assert!(
            validate_transition(
                DocumentStatus::ConversionComplete,
                DocumentStatus::ChunkingStarted
            )
            .is_err()
        );
        assert!(
            validate_transition(DocumentStatus::ParsingComplete, DocumentStatus::Ready).is_err()
        );
    }

    #[test]
    fn failure_is_terminal_for_the_attempt() {
        assert!(
            validate_transition(
                DocumentStatus::ParsingStarted,
                DocumentStatus::ParsingFailed
            )
            .is_ok()
        );
        // No roll-back to the predecessor's completion state.
        assert!(
            validate_transition(
                DocumentStatus::ParsingFailed,
                DocumentStatus::ConversionComplete
            )
            .is_err()
        );
        // Recovery is an external re-trigger of the same stage.
        assert!(
            validate_transition(
                DocumentStatus::ParsingFailed,
                DocumentStatus::ParsingStarted
            )
            .is_ok()
        );
    }

    #[test]
    fn retrigger_from_later_states_is_legal() {
        assert!(
            validate_transition(DocumentStatus::Ready, DocumentStatus::ConversionStarted).is_ok()
        );
        assert!(
            validate_transition(
                DocumentStatus::ChunkingFailed,
                DocumentStatus::ConversionStarted
            )
            .is_ok()
        );
    }

    #[test]
    fn upload_failed_reachable_from_anywhere() {
        for from in [
            DocumentStatus::Uploading,
            DocumentStatus::ConversionStarted,
            DocumentStatus::EmbeddingComplete,
            DocumentStatus::Ready,
        ] {
            assert!(validate_transition(from, DocumentStatus::UploadFailed).is_ok());
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for stage in STAGE_SEQUENCE {
            for status in [stage.started(), stage.complete(), stage.failed()] {
                assert_eq!(DocumentStatus::parse(status.as_str()), Some(status));
            }
        }
        assert_eq!(DocumentStatus::parse("ready"), Some(DocumentStatus::Ready));
        assert_eq!(DocumentStatus::parse("bogus"), None);
    }
}
