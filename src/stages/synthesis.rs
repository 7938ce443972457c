//! Synthesis: plan + resource descriptor to a runnable program.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    check_cancelled, generate_text, GenerationSettings, ResourceDescriptor, Stage, StageKind,
    StructuredPlan,
};
use crate::error::StageError;
use crate::llm::LlmProvider;
use crate::pipeline::PipelineState;
use crate::prompts::{PromptContext, StagePrompt, SYNTHESIS_SYSTEM, SYNTHESIS_USER};
use crate::utils::{parse_program, Parsed};

pub struct SynthesisStage {
    llm: Arc<dyn LlmProvider>,
    settings: GenerationSettings,
    program_file_name: String,
}

impl std::fmt::Debug for SynthesisStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisStage")
            .field("settings", &self.settings)
            .field("program_file_name", &self.program_file_name)
            .finish_non_exhaustive()
    }
}

impl SynthesisStage {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        settings: GenerationSettings,
        program_file_name: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            settings,
            program_file_name: program_file_name.into(),
        }
    }

    pub async fn synthesize(
        &self,
        plan: &StructuredPlan,
        resource: &ResourceDescriptor,
        workspace_display: &str,
    ) -> Result<String, StageError> {
        let ctx = PromptContext::new()
            .with("plan", plan)
            .with("resource", resource)
            .with("workspace", workspace_display)
            .with("program_file", self.program_file_name.as_str());
        let prompt = StagePrompt::render(SYNTHESIS_SYSTEM, SYNTHESIS_USER, &ctx);

        let raw = generate_text(self.llm.as_ref(), &self.settings, prompt, StageKind::Synthesis)
            .await
            .map_err(|source| StageError::Collaborator {
                stage: StageKind::Synthesis,
                source,
            })?;

        match parse_program(&raw) {
            Parsed::Ok(program) => Ok(program),
            Parsed::Fallback(program) => {
                warn!(stage = "synthesis", "Program extracted from fenced block");
                Ok(program)
            }
            Parsed::Failed(_) => Err(StageError::malformed(
                StageKind::Synthesis,
                "collaborator returned no program text",
            )),
        }
    }
}

#[async_trait]
impl Stage for SynthesisStage {
    fn kind(&self) -> StageKind {
        StageKind::Synthesis
    }

    async fn apply(
        &self,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        check_cancelled(cancel)?;
        let workspace = state.workspace()?.root().display().to_string();
        let program = self
            .synthesize(state.plan()?, state.resource_descriptor()?, &workspace)
            .await?;
        info!(lines = program.lines().count(), "Program synthesized");
        state.program_text = program;
        Ok(())
    }
}
