//! Stage dispatch: the registry of runners and the retry loop around them.
//!
//! The dispatcher owns the cross-stage policy. A runner reports success or a
//! [`StageFailure`]; the dispatcher persists the failed status, and retries
//! only failures marked retryable, up to the attempt budget. A concurrency
//! semaphore caps how many stage executions run at once across all documents.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use super::context::StageContext;
use super::state::Stage;
use crate::db::Database;
use crate::error::{ServiceError, ServiceResult, StageFailure};

/// What a completed stage reports back for logging.
#[derive(Debug, Clone, Default)]
pub struct StageSummary {
    pub detail: String,
}

impl StageSummary {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// One pipeline stage implementation. The runner is responsible for marking
/// its own started/completed transitions; the dispatcher records failures.
pub trait StageRunner: Send + Sync {
    fn stage(&self) -> Stage;

    fn run<'a>(
        &'a self,
        ctx: &'a StageContext,
    ) -> BoxFuture<'a, Result<StageSummary, StageFailure>>;
}

/// Explicit mapping from stage to runner. Built once at startup; the
/// orchestrator refuses to run a sequence it has no runner for.
#[derive(Default)]
pub struct StageRegistry {
    runners: HashMap<Stage, Arc<dyn StageRunner>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, runner: Arc<dyn StageRunner>) -> Self {
        self.runners.insert(runner.stage(), runner);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageRunner>> {
        self.runners.get(&stage).cloned()
    }
}

/// Executes single stages with retry and bounded concurrency.
pub struct StageDispatcher {
    db: Arc<Database>,
    registry: StageRegistry,
    max_attempts: u32,
    retry_delay: Duration,
    permits: Semaphore,
}

impl StageDispatcher {
    pub fn new(
        db: Arc<Database>,
        registry: StageRegistry,
        max_attempts: u32,
        retry_delay: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            db,
            registry,
            max_attempts: max_attempts.max(1),
            retry_delay,
            permits: Semaphore::new(max_concurrent.max(1)),
        }
    }

    /// Run one stage for one document to completion or terminal failure.
    pub async fn execute(&self, stage: Stage, ctx: &StageContext) -> ServiceResult<StageSummary> {
        let runner = self
            .registry
            .get(stage)
            .ok_or_else(|| ServiceError::Internal {
                message: format!("no runner registered for stage '{}'", stage.name()),
            })?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ServiceError::Internal {
                message: "stage dispatcher is shut down".to_string(),
            })?;

        for attempt in 1..=self.max_attempts {
            info!(
                document_id = %ctx.document_id,
                stage = stage.name(),
                attempt,
                "Executing stage"
            );

            let failure = match runner.run(ctx).await {
                Ok(summary) => {
                    info!(
                        document_id = %ctx.document_id,
                        stage = stage.name(),
                        detail = %summary.detail,
                        "Stage completed"
                    );
                    return Ok(summary);
                }
                Err(failure) => failure,
            };

            // Persist the failed status; the document stays addressable in
            // its failed state even if this was the last attempt.
            if let Err(e) = self
                .db
                .mark_stage_failed(&ctx.document_id, stage, &failure.message)
            {
                error!(
                    document_id = %ctx.document_id,
                    stage = stage.name(),
                    error = %e,
                    "Could not persist stage failure"
                );
            }

            if failure.retryable && attempt < self.max_attempts {
                warn!(
                    document_id = %ctx.document_id,
                    stage = stage.name(),
                    attempt,
                    error = %failure.message,
                    "Stage failed, retrying"
                );
                tokio::time::sleep(self.retry_delay).await;
                continue;
            }

            error!(
                document_id = %ctx.document_id,
                stage = stage.name(),
                attempt,
                retryable = failure.retryable,
                error = %failure.message,
                "Stage failed permanently"
            );
            return Err(ServiceError::Stage(crate::error::StageError::for_stage(
                stage,
                failure.message,
            )));
        }

        unreachable!("attempt loop always returns")
    }
}
