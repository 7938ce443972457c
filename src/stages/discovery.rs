//! Resource discovery: picks a concrete dataset for the plan.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{check_cancelled, generate_text, GenerationSettings, Stage, StageKind};
use crate::error::StageError;
use crate::llm::LlmProvider;
use crate::pipeline::PipelineState;
use crate::prompts::{PromptContext, StagePrompt, DISCOVERY_SYSTEM, DISCOVERY_USER};
use crate::utils::lenient::{lenient_text, string_or_list};
use crate::utils::{parse_structured, preview, Parsed};

/// The dataset the synthesized program should load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(default, deserialize_with = "lenient_text")]
    pub name: String,
    /// Hugging Face dataset id, when the resource is hosted there.
    #[serde(default, deserialize_with = "lenient_text")]
    pub hf_id: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub task: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub target: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pub features: Vec<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub load_snippet: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub notes: String,
}

impl ResourceDescriptor {
    /// Usable when it names the resource one way or another.
    pub fn is_usable(&self) -> bool {
        !self.name.trim().is_empty() || !self.hf_id.trim().is_empty()
    }
}

/// The collaborator nests the descriptor under `"dataset"`; a flat object
/// is accepted too.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope {
    Wrapped { dataset: ResourceDescriptor },
    Flat(ResourceDescriptor),
}

impl Envelope {
    fn into_descriptor(self) -> ResourceDescriptor {
        match self {
            Envelope::Wrapped { dataset } => dataset,
            Envelope::Flat(descriptor) => descriptor,
        }
    }

    fn descriptor(&self) -> &ResourceDescriptor {
        match self {
            Envelope::Wrapped { dataset } => dataset,
            Envelope::Flat(descriptor) => descriptor,
        }
    }
}

/// Parses a discovery response in either envelope shape.
pub fn parse_descriptor(raw: &str) -> Parsed<ResourceDescriptor> {
    parse_structured(raw, |env: &Envelope| env.descriptor().is_usable()).map(Envelope::into_descriptor)
}

pub struct DiscoveryStage {
    llm: Arc<dyn LlmProvider>,
    settings: GenerationSettings,
}

impl std::fmt::Debug for DiscoveryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryStage")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DiscoveryStage {
    pub fn new(llm: Arc<dyn LlmProvider>, settings: GenerationSettings) -> Self {
        Self { llm, settings }
    }

    pub async fn discover(
        &self,
        plan: &super::StructuredPlan,
    ) -> Result<ResourceDescriptor, StageError> {
        let ctx = PromptContext::new().with("plan", plan);
        let prompt = StagePrompt::render(DISCOVERY_SYSTEM, DISCOVERY_USER, &ctx);

        let raw = generate_text(self.llm.as_ref(), &self.settings, prompt, StageKind::Discovery)
            .await
            .map_err(|source| StageError::Collaborator {
                stage: StageKind::Discovery,
                source,
            })?;

        match parse_descriptor(&raw) {
            Parsed::Ok(descriptor) => Ok(descriptor),
            Parsed::Fallback(descriptor) => {
                warn!(stage = "discovery", "Descriptor salvaged from non-JSON response");
                Ok(descriptor)
            }
            Parsed::Failed(raw) => Err(StageError::malformed(
                StageKind::Discovery,
                format!("no named dataset in: {}", preview(&raw, 200)),
            )),
        }
    }
}

#[async_trait]
impl Stage for DiscoveryStage {
    fn kind(&self) -> StageKind {
        StageKind::Discovery
    }

    async fn apply(
        &self,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        check_cancelled(cancel)?;
        let descriptor = self.discover(state.plan()?).await?;
        info!(dataset = %descriptor.name, hf_id = %descriptor.hf_id, "Resource selected");
        state.resource_descriptor = Some(descriptor);
        Ok(())
    }
}
