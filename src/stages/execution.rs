//! Execution: writes the current program into the workspace, runs it, and
//! reconciles the exit status with the artifacts it left behind.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{check_cancelled, Stage, StageKind};
use crate::error::StageError;
use crate::pipeline::{AttemptRecord, PipelineState};
use crate::runner::{ExecutionFault, ExecutionResult, ProgramExecutor};
use crate::workspace::Workspace;

pub const DEFAULT_PROGRAM_FILE: &str = "ml_pipeline.py";
pub const DEFAULT_MAX_DIAGNOSTICS_CHARS: usize = 8000;

/// Hex SHA-256 of a program text.
pub fn program_digest(program: &str) -> String {
    hex::encode(Sha256::digest(program.as_bytes()))
}

/// Workspace-side behaviour of the Execution stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// File name under `code/`; the same name is overwritten every attempt.
    pub program_file_name: String,
    /// Empty `artifacts/` before each attempt so earlier output cannot
    /// mark a later crash as successful.
    pub clear_artifacts_before_attempt: bool,
    pub max_diagnostics_chars: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            program_file_name: DEFAULT_PROGRAM_FILE.to_string(),
            clear_artifacts_before_attempt: true,
            max_diagnostics_chars: DEFAULT_MAX_DIAGNOSTICS_CHARS,
        }
    }
}

pub struct ExecutionStage {
    executor: Arc<dyn ProgramExecutor>,
    options: ExecutionOptions,
}

impl std::fmt::Debug for ExecutionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStage")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ExecutionStage {
    pub fn new(executor: Arc<dyn ProgramExecutor>, options: ExecutionOptions) -> Self {
        Self { executor, options }
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Persists `program`, runs it, and applies the artifact override.
    ///
    /// Only workspace I/O failures are errors; everything that goes wrong
    /// with the program itself is described by the returned result.
    pub async fn execute(
        &self,
        program: &str,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, StageError> {
        if program.trim().is_empty() {
            return Err(StageError::InvalidState(
                "execution requires a non-empty program".to_string(),
            ));
        }

        if self.options.clear_artifacts_before_attempt && workspace.has_artifacts()? {
            let removed = workspace.clear_artifacts()?;
            debug!(removed, "Cleared stale artifacts");
        }

        let path = workspace.write_program(&self.options.program_file_name, program)?;
        let outcome = self.executor.run(&path, workspace, cancel).await;
        let artifacts = workspace.list_artifacts()?;
        let result = ExecutionResult::reconcile(outcome, artifacts);

        if let Some(reason) = result.override_reason() {
            warn!(reason = %reason, "Execution marked successful by artifact presence");
        }
        Ok(result)
    }
}

#[async_trait]
impl Stage for ExecutionStage {
    fn kind(&self) -> StageKind {
        StageKind::Execution
    }

    async fn apply(
        &self,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        check_cancelled(cancel)?;
        let number = state.attempts.len() as u32 + 1;
        let digest = program_digest(&state.program_text);

        let result = self
            .execute(&state.program_text, state.workspace()?, cancel)
            .await?;

        info!(
            attempt = number,
            success = result.success,
            exit_code = ?result.exit_code,
            artifacts = result.artifacts.len(),
            "Execution finished"
        );

        let diagnostics = (!result.success)
            .then(|| result.diagnostics(self.options.max_diagnostics_chars));
        state
            .attempts
            .push(AttemptRecord::new(number, digest, &result, diagnostics.clone()));

        let cancelled = result.fault == Some(ExecutionFault::Cancelled);
        if let Some(diagnostics) = diagnostics {
            state.last_failure_diagnostics = Some(diagnostics);
        }
        state.execution_result = Some(result);

        if cancelled {
            return Err(StageError::Cancelled);
        }
        Ok(())
    }
}
