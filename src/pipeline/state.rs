//! The record threaded through every stage of one run.

use std::path::Path;

use serde::Serialize;

use super::result::AttemptRecord;
use crate::error::StageError;
use crate::runner::ExecutionResult;
use crate::stages::{ResourceDescriptor, ResultSummary, StructuredPlan};
use crate::workspace::Workspace;

/// Mutable state of a single pipeline run.
///
/// Created once per request, mutated in place by each stage in order and
/// never shared between runs. The request text and workspace are fixed
/// once set; everything else is owned by the stage that produces it.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
    run_id: String,
    request_text: String,
    workspace: Option<Workspace>,

    /// Set by Planning.
    pub plan: Option<StructuredPlan>,
    /// Set by Discovery.
    pub resource_descriptor: Option<ResourceDescriptor>,
    /// Set by Synthesis, replaced by Repair.
    pub program_text: String,
    /// Result of the most recent Execution only.
    pub execution_result: Option<ExecutionResult>,
    /// Diagnostics of the most recent failed attempt.
    pub last_failure_diagnostics: Option<String>,
    /// Set by Summarization.
    pub summary: Option<ResultSummary>,
    /// Number of failed executions so far; 0 on the first attempt.
    pub attempt_count: u32,
    /// One record per Execution invocation.
    pub attempts: Vec<AttemptRecord>,
}

impl PipelineState {
    pub fn new(run_id: impl Into<String>, request_text: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            request_text: request_text.into(),
            workspace: None,
            plan: None,
            resource_descriptor: None,
            program_text: String::new(),
            execution_result: None,
            last_failure_diagnostics: None,
            summary: None,
            attempt_count: 0,
            attempts: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn request_text(&self) -> &str {
        &self.request_text
    }

    /// Binds the run's workspace. Fails if one is already bound.
    pub fn set_workspace(&mut self, workspace: Workspace) -> Result<(), StageError> {
        if let Some(existing) = &self.workspace {
            return Err(StageError::InvalidState(format!(
                "workspace already set to {}",
                existing.root().display()
            )));
        }
        self.workspace = Some(workspace);
        Ok(())
    }

    pub fn workspace(&self) -> Result<&Workspace, StageError> {
        self.workspace
            .as_ref()
            .ok_or_else(|| StageError::InvalidState("workspace not provisioned".to_string()))
    }

    pub fn workspace_path(&self) -> Option<&Path> {
        self.workspace.as_ref().map(Workspace::root)
    }

    pub fn plan(&self) -> Result<&StructuredPlan, StageError> {
        self.plan
            .as_ref()
            .ok_or_else(|| StageError::InvalidState("plan not set".to_string()))
    }

    pub fn resource_descriptor(&self) -> Result<&ResourceDescriptor, StageError> {
        self.resource_descriptor
            .as_ref()
            .ok_or_else(|| StageError::InvalidState("resource descriptor not set".to_string()))
    }

    pub fn execution_result(&self) -> Result<&ExecutionResult, StageError> {
        self.execution_result
            .as_ref()
            .ok_or_else(|| StageError::InvalidState("no execution result".to_string()))
    }

    /// Total Execution invocations so far.
    pub fn executions(&self) -> usize {
        self.attempts.len()
    }
}
