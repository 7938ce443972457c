//! Repair: failing program + diagnostics to a revised program.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::execution::program_digest;
use super::{check_cancelled, generate_text, GenerationSettings, Stage, StageKind};
use crate::error::StageError;
use crate::llm::LlmProvider;
use crate::pipeline::PipelineState;
use crate::prompts::{PromptContext, StagePrompt, REPAIR_SYSTEM, REPAIR_USER};
use crate::utils::{parse_program, Parsed};

/// Asks the collaborator for a corrected program.
///
/// There is no retry here: a collaborator that cannot produce text ends
/// the run with `RepairFailed` instead of spinning the loop.
pub struct RepairStage {
    llm: Arc<dyn LlmProvider>,
    settings: GenerationSettings,
}

impl std::fmt::Debug for RepairStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairStage")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RepairStage {
    pub fn new(llm: Arc<dyn LlmProvider>, settings: GenerationSettings) -> Self {
        Self { llm, settings }
    }

    /// Returns a non-empty revised program or `RepairFailed`.
    pub async fn repair(
        &self,
        program: &str,
        diagnostics: &str,
        attempt: u32,
    ) -> Result<String, StageError> {
        let ctx = PromptContext::new()
            .with("program", program)
            .with("diagnostics", diagnostics)
            .with("attempt", attempt);
        let prompt = StagePrompt::render(REPAIR_SYSTEM, REPAIR_USER, &ctx);

        let raw = generate_text(self.llm.as_ref(), &self.settings, prompt, StageKind::Repair)
            .await
            .map_err(|e| StageError::RepairFailed(format!("collaborator call failed: {}", e)))?;

        match parse_program(&raw) {
            Parsed::Ok(revised) | Parsed::Fallback(revised) => Ok(revised),
            Parsed::Failed(_) => Err(StageError::RepairFailed(
                "collaborator returned no program text".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Stage for RepairStage {
    fn kind(&self) -> StageKind {
        StageKind::Repair
    }

    async fn apply(
        &self,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        check_cancelled(cancel)?;
        let diagnostics = state
            .last_failure_diagnostics
            .as_deref()
            .ok_or_else(|| StageError::InvalidState("repair without diagnostics".to_string()))?;

        let revised = self
            .repair(&state.program_text, diagnostics, state.attempt_count)
            .await?;

        if program_digest(&revised) == program_digest(&state.program_text) {
            warn!(attempt = state.attempt_count, "Repair returned an unchanged program");
        }
        info!(attempt = state.attempt_count, lines = revised.lines().count(), "Program repaired");
        state.program_text = revised;
        Ok(())
    }
}
