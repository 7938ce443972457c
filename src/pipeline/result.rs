//! Run outcomes and the persisted run report.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::runner::{ExecutionFault, ExecutionResult};
use crate::stages::{ResourceDescriptor, ResultSummary, StageKind, StructuredPlan};

/// File written at the workspace root when a run ends.
pub const RUN_REPORT_FILE: &str = "run_report.json";

/// One Execution invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based execution number.
    pub number: u32,
    /// SHA-256 of the program text that ran.
    pub program_digest: String,
    pub success: bool,
    pub success_override: bool,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<ExecutionFault>,
    pub artifacts: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl AttemptRecord {
    pub fn new(
        number: u32,
        program_digest: String,
        result: &ExecutionResult,
        diagnostics: Option<String>,
    ) -> Self {
        Self {
            number,
            program_digest,
            success: result.success,
            success_override: result.success_override,
            exit_code: result.exit_code,
            fault: result.fault.clone(),
            artifacts: result.artifacts.len(),
            duration_ms: result.duration_ms,
            diagnostics,
        }
    }
}

/// Why a run ended in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Every allowed execution failed.
    RetryBudgetExhausted,
    MalformedCollaboratorOutput,
    /// A collaborator could not be reached.
    Collaborator,
    RepairFailed,
    Workspace,
    InvalidState,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RetryBudgetExhausted => "retry budget exhausted",
            FailureReason::MalformedCollaboratorOutput => "malformed collaborator output",
            FailureReason::Collaborator => "collaborator unavailable",
            FailureReason::RepairFailed => "repair failed",
            FailureReason::Workspace => "workspace error",
            FailureReason::InvalidState => "invalid pipeline state",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&StageError> for FailureReason {
    fn from(err: &StageError) -> Self {
        match err {
            StageError::MalformedCollaboratorOutput { .. } => FailureReason::MalformedCollaboratorOutput,
            StageError::Collaborator { .. } => FailureReason::Collaborator,
            StageError::RepairFailed(_) => FailureReason::RepairFailed,
            StageError::Workspace(_) => FailureReason::Workspace,
            StageError::InvalidState(_) => FailureReason::InvalidState,
            StageError::Cancelled => FailureReason::Cancelled,
        }
    }
}

/// The only two ways a run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineResult {
    Completed {
        summary: ResultSummary,
        workspace_path: PathBuf,
        attempt_count: u32,
        executions: usize,
    },
    Failed {
        reason: FailureReason,
        /// Diagnostics of the last failed execution, or the fatal error
        /// text when the run never got that far.
        last_diagnostics: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed_stage: Option<StageKind>,
        /// `None` only if provisioning itself failed.
        workspace_path: Option<PathBuf>,
        attempt_count: u32,
        executions: usize,
    },
}

impl PipelineResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineResult::Completed { .. })
    }

    pub fn workspace_path(&self) -> Option<&Path> {
        match self {
            PipelineResult::Completed { workspace_path, .. } => Some(workspace_path),
            PipelineResult::Failed { workspace_path, .. } => workspace_path.as_deref(),
        }
    }

    pub fn summary(&self) -> Option<&ResultSummary> {
        match self {
            PipelineResult::Completed { summary, .. } => Some(summary),
            PipelineResult::Failed { .. } => None,
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            PipelineResult::Completed { .. } => None,
            PipelineResult::Failed { reason, .. } => Some(*reason),
        }
    }

    pub fn attempt_count(&self) -> u32 {
        match self {
            PipelineResult::Completed { attempt_count, .. }
            | PipelineResult::Failed { attempt_count, .. } => *attempt_count,
        }
    }

    /// Number of Execution invocations.
    pub fn executions(&self) -> usize {
        match self {
            PipelineResult::Completed { executions, .. }
            | PipelineResult::Failed { executions, .. } => *executions,
        }
    }
}

/// Everything worth keeping about a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub request: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub plan: Option<StructuredPlan>,
    pub resource_descriptor: Option<ResourceDescriptor>,
    pub attempts: Vec<AttemptRecord>,
    pub result: PipelineResult,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LlmError, WorkspaceError};

    #[test]
    fn test_failure_reason_from_stage_error() {
        let cases = [
            (StageError::malformed(StageKind::Planning, "x"), FailureReason::MalformedCollaboratorOutput),
            (
                StageError::Collaborator {
                    stage: StageKind::Discovery,
                    source: LlmError::EmptyResponse,
                },
                FailureReason::Collaborator,
            ),
            (StageError::RepairFailed("x".into()), FailureReason::RepairFailed),
            (
                StageError::Workspace(WorkspaceError::NameExhausted {
                    root: PathBuf::from("/p"),
                    attempts: 1,
                }),
                FailureReason::Workspace,
            ),
            (StageError::Cancelled, FailureReason::Cancelled),
        ];
        for (err, expected) in cases {
            assert_eq!(FailureReason::from(&err), expected);
        }
    }

    #[test]
    fn test_result_serializes_with_status_tag() {
        let result = PipelineResult::Failed {
            reason: FailureReason::RetryBudgetExhausted,
            last_diagnostics: "[exit code 1]".to_string(),
            failed_stage: None,
            workspace_path: Some(PathBuf::from("/p/project_1")),
            attempt_count: 3,
            executions: 3,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["reason"], "retry_budget_exhausted");
        assert!(json.get("failed_stage").is_none());

        let back: PipelineResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
        assert_eq!(back.executions(), 3);
        assert!(!back.is_completed());
    }

    #[test]
    fn test_completed_accessors() {
        let result = PipelineResult::Completed {
            summary: ResultSummary::default(),
            workspace_path: PathBuf::from("/p/project_2"),
            attempt_count: 1,
            executions: 2,
        };
        assert!(result.is_completed());
        assert!(result.summary().is_some());
        assert_eq!(result.workspace_path(), Some(Path::new("/p/project_2")));
        assert_eq!(result.failure_reason(), None);
    }
}
