//! Pipeline stages.
//!
//! Each stage is a single-shot transformation of [`PipelineState`]:
//!
//! | Stage | Reads | Writes |
//! |---|---|---|
//! | [`PlanningStage`] | request text | `plan` |
//! | [`DiscoveryStage`] | `plan` | `resource_descriptor` |
//! | [`SynthesisStage`] | `plan`, `resource_descriptor` | `program_text` |
//! | [`ExecutionStage`] | `program_text` | `execution_result`, `last_failure_diagnostics` |
//! | [`RepairStage`] | `program_text`, `last_failure_diagnostics` | `program_text` |
//! | [`SummarizationStage`] | `execution_result` | `summary` |
//!
//! Collaborator-backed stages hold their `Arc<dyn LlmProvider>` and
//! [`GenerationSettings`]; nothing is read from global state.

pub mod discovery;
pub mod execution;
pub mod planning;
pub mod repair;
pub mod summarization;
pub mod synthesis;

pub use discovery::{DiscoveryStage, ResourceDescriptor};
pub use execution::{ExecutionOptions, ExecutionStage};
pub use planning::{PlanningStage, StructuredPlan};
pub use repair::RepairStage;
pub use summarization::{summarize_locally, ResultSummary, SummarizationStage, SummarySource};
pub use synthesis::SynthesisStage;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{LlmError, StageError};
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::pipeline::PipelineState;
use crate::prompts::StagePrompt;
use crate::utils::preview;

/// Identifies a stage in logs, errors and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Planning,
    Discovery,
    Synthesis,
    Execution,
    Repair,
    Summarization,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Planning => "planning",
            StageKind::Discovery => "discovery",
            StageKind::Synthesis => "synthesis",
            StageKind::Execution => "execution",
            StageKind::Repair => "repair",
            StageKind::Summarization => "summarization",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Reads its inputs from `state` and writes its output field back.
    ///
    /// Any `Err` is fatal to the run.
    async fn apply(
        &self,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> Result<(), StageError>;
}

/// Sampling parameters sent with every collaborator request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    /// Empty means the provider's default model.
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.2,
            max_tokens: 4096,
        }
    }
}

impl GenerationSettings {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the temperature for LLM generation.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Sends one system/user prompt pair and returns the response text.
pub(crate) async fn generate_text(
    llm: &dyn LlmProvider,
    settings: &GenerationSettings,
    prompt: StagePrompt,
    stage: StageKind,
) -> Result<String, LlmError> {
    let request = GenerationRequest::new(
        settings.model.clone(),
        vec![Message::system(prompt.system), Message::user(prompt.user)],
    )
    .with_temperature(settings.temperature)
    .with_max_tokens(settings.max_tokens);

    let text = llm.generate(request).await?.into_text()?;
    tracing::debug!(stage = %stage, chars = text.len(), preview = %preview(&text, 200), "Collaborator responded");
    Ok(text)
}

/// Returns `Cancelled` if the token has fired.
pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<(), StageError> {
    if cancel.is_cancelled() {
        Err(StageError::Cancelled)
    } else {
        Ok(())
    }
}
