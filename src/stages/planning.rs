//! Planning: turns the free-text request into a structured plan.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{check_cancelled, generate_text, GenerationSettings, Stage, StageKind};
use crate::error::StageError;
use crate::llm::LlmProvider;
use crate::pipeline::PipelineState;
use crate::prompts::{PromptContext, StagePrompt, PLANNING_SYSTEM, PLANNING_USER};
use crate::utils::lenient::{lenient_text, string_or_list};
use crate::utils::{parse_structured, preview, Parsed};

/// What to build, as decided by the planning collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredPlan {
    #[serde(default, deserialize_with = "lenient_text")]
    pub problem: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub dataset_requirements: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub model_family: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pub metrics: Vec<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub notes: String,
}

impl StructuredPlan {
    /// A plan is usable once it states the problem.
    pub fn is_usable(&self) -> bool {
        !self.problem.trim().is_empty()
    }
}

/// Parses a planning response, salvaging embedded JSON if needed.
pub fn parse_plan(raw: &str) -> Parsed<StructuredPlan> {
    parse_structured(raw, StructuredPlan::is_usable)
}

pub struct PlanningStage {
    llm: Arc<dyn LlmProvider>,
    settings: GenerationSettings,
}

impl std::fmt::Debug for PlanningStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanningStage")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PlanningStage {
    pub fn new(llm: Arc<dyn LlmProvider>, settings: GenerationSettings) -> Self {
        Self { llm, settings }
    }

    /// Produces a plan for `request`.
    pub async fn plan(&self, request: &str) -> Result<StructuredPlan, StageError> {
        let ctx = PromptContext::new().with("user_prompt", request);
        let prompt = StagePrompt::render(PLANNING_SYSTEM, PLANNING_USER, &ctx);

        let raw = generate_text(self.llm.as_ref(), &self.settings, prompt, StageKind::Planning)
            .await
            .map_err(|source| StageError::Collaborator {
                stage: StageKind::Planning,
                source,
            })?;

        match parse_plan(&raw) {
            Parsed::Ok(plan) => Ok(plan),
            Parsed::Fallback(plan) => {
                warn!(stage = "planning", "Plan salvaged from non-JSON response");
                Ok(plan)
            }
            Parsed::Failed(raw) => Err(StageError::malformed(
                StageKind::Planning,
                format!("no plan with a problem statement in: {}", preview(&raw, 200)),
            )),
        }
    }
}

#[async_trait]
impl Stage for PlanningStage {
    fn kind(&self) -> StageKind {
        StageKind::Planning
    }

    async fn apply(
        &self,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        check_cancelled(cancel)?;
        let plan = self.plan(state.request_text()).await?;
        info!(problem = %plan.problem, metrics = ?plan.metrics, "Plan ready");
        state.plan = Some(plan);
        Ok(())
    }
}
