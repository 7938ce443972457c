//! The pipeline state machine and its driver.
//!
//! ```text
//! Setup → Planning → Discovery → Synthesis → Execution ─┬─ success ─→ Summarization → Done
//!                                               ▲       │
//!                                               │       └─ failure ─┬─→ Repair ──┐
//!                                               └───────────────────┼────────────┘
//!                                                                   └─→ Aborted (budget spent)
//! ```
//!
//! Transitions are computed by [`PipelinePhase::next`] from the phase just
//! completed and the state it left behind; the engine only drives stages
//! and maps fatal stage errors to [`PipelineResult::Failed`].

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::config::PipelineConfig;
use super::result::{FailureReason, PipelineResult, RunReport, RUN_REPORT_FILE};
use super::state::PipelineState;
use crate::error::{ConfigError, StageError};
use crate::llm::LlmProvider;
use crate::runner::{ExecutionResult, ProcessExecutor, ProgramExecutor};
use crate::stages::{
    DiscoveryStage, ExecutionStage, PlanningStage, RepairStage, Stage, StageKind,
    SummarizationStage, SynthesisStage,
};
use crate::workspace::WorkspaceProvisioner;

/// States of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Setup,
    Planning,
    Discovery,
    Synthesis,
    Execution,
    Repair,
    Summarization,
    Done,
    Aborted,
}

/// Which way the post-execution branch goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionRoute {
    Success,
    Failure,
}

/// The single conditional branch: exit 0 or artifacts present is success.
pub fn route_after_execution(result: &ExecutionResult) -> ExecutionRoute {
    if result.success || result.has_artifacts() {
        ExecutionRoute::Success
    } else {
        ExecutionRoute::Failure
    }
}

impl PipelinePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelinePhase::Done | PipelinePhase::Aborted)
    }

    /// The stage run in this phase, if any.
    pub fn stage(self) -> Option<StageKind> {
        match self {
            PipelinePhase::Planning => Some(StageKind::Planning),
            PipelinePhase::Discovery => Some(StageKind::Discovery),
            PipelinePhase::Synthesis => Some(StageKind::Synthesis),
            PipelinePhase::Execution => Some(StageKind::Execution),
            PipelinePhase::Repair => Some(StageKind::Repair),
            PipelinePhase::Summarization => Some(StageKind::Summarization),
            PipelinePhase::Setup | PipelinePhase::Done | PipelinePhase::Aborted => None,
        }
    }

    /// Transition after this phase completed without a fatal error.
    ///
    /// After Execution, `state.attempt_count` must already count the
    /// attempt if it failed.
    pub fn next(self, state: &PipelineState, max_retries: u32) -> PipelinePhase {
        match self {
            PipelinePhase::Setup => PipelinePhase::Planning,
            PipelinePhase::Planning => PipelinePhase::Discovery,
            PipelinePhase::Discovery => PipelinePhase::Synthesis,
            PipelinePhase::Synthesis => PipelinePhase::Execution,
            PipelinePhase::Execution => {
                let route = state
                    .execution_result
                    .as_ref()
                    .map(route_after_execution)
                    .unwrap_or(ExecutionRoute::Failure);
                match route {
                    ExecutionRoute::Success => PipelinePhase::Summarization,
                    ExecutionRoute::Failure if state.attempt_count > max_retries => {
                        PipelinePhase::Aborted
                    }
                    ExecutionRoute::Failure => PipelinePhase::Repair,
                }
            }
            PipelinePhase::Repair => PipelinePhase::Execution,
            PipelinePhase::Summarization => PipelinePhase::Done,
            PipelinePhase::Done => PipelinePhase::Done,
            PipelinePhase::Aborted => PipelinePhase::Aborted,
        }
    }
}

/// Drives requests through the stage graph.
///
/// The engine holds only immutable configuration and collaborator handles;
/// every run builds its own [`PipelineState`] and workspace, so any number
/// of runs may share one engine concurrently.
pub struct PipelineEngine {
    config: PipelineConfig,
    provisioner: WorkspaceProvisioner,
    planning: PlanningStage,
    discovery: DiscoveryStage,
    synthesis: SynthesisStage,
    execution: ExecutionStage,
    repair: RepairStage,
    summarization: SummarizationStage,
    concurrency_limiter: Arc<Semaphore>,
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineEngine {
    /// Builds an engine around explicit collaborators.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if `config` does not validate.
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        executor: Arc<dyn ProgramExecutor>,
        config: PipelineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let settings = config.generation_settings();
        Ok(Self {
            provisioner: WorkspaceProvisioner::new(config.workspace_root.clone()),
            planning: PlanningStage::new(llm.clone(), settings.clone()),
            discovery: DiscoveryStage::new(llm.clone(), settings.clone()),
            synthesis: SynthesisStage::new(
                llm.clone(),
                settings.clone(),
                config.program_file_name.clone(),
            ),
            execution: ExecutionStage::new(executor, config.execution_options()),
            repair: RepairStage::new(llm.clone(), settings.clone()),
            summarization: SummarizationStage::new(llm, settings),
            concurrency_limiter: Arc::new(Semaphore::new(config.max_concurrent_runs)),
            config,
        })
    }

    /// Builds an engine that runs programs as local child processes.
    pub fn with_process_executor(
        llm: Arc<dyn LlmProvider>,
        config: PipelineConfig,
    ) -> Result<Self, ConfigError> {
        let executor = Arc::new(ProcessExecutor::new(config.execution_config()));
        Self::new(llm, executor, config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs one request to completion.
    pub async fn run(&self, request: &str) -> PipelineResult {
        self.run_with_cancel(request, &CancellationToken::new()).await
    }

    /// Runs one request, honouring `cancel` at stage boundaries and during
    /// execution.
    pub async fn run_with_cancel(&self, request: &str, cancel: &CancellationToken) -> PipelineResult {
        self.run_report(request, cancel).await.result
    }

    /// Runs one request and returns the full report.
    ///
    /// The report is also written to `run_report.json` in the workspace.
    pub async fn run_report(&self, request: &str, cancel: &CancellationToken) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("pipeline_run", run_id = %run_id);
        self.drive(run_id, request, cancel).instrument(span).await
    }

    /// Runs independent requests concurrently, at most
    /// `max_concurrent_runs` at a time. Results keep the input order.
    pub async fn run_batch(&self, requests: &[String], cancel: &CancellationToken) -> Vec<PipelineResult> {
        if requests.is_empty() {
            return Vec::new();
        }

        let futures: Vec<_> = requests
            .iter()
            .map(|request| async move {
                // The semaphore is never closed, so acquire cannot fail.
                let _permit = self.concurrency_limiter.acquire().await.ok();
                self.run_with_cancel(request, cancel).await
            })
            .collect();

        futures::future::join_all(futures).await
    }

    async fn drive(&self, run_id: String, request: &str, cancel: &CancellationToken) -> RunReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut state = PipelineState::new(run_id, request);
        let max_retries = self.config.max_retries;

        info!(max_retries, "Pipeline started");

        let mut phase = PipelinePhase::Setup;
        let outcome = loop {
            if phase.is_terminal() {
                break Ok(phase);
            }
            if let Err(e) = self.step(phase, &mut state, cancel).await {
                break Err((phase, e));
            }
            if phase == PipelinePhase::Execution
                && state.execution_result.as_ref().map(route_after_execution)
                    != Some(ExecutionRoute::Success)
            {
                state.attempt_count += 1;
                warn!(
                    attempt_count = state.attempt_count,
                    max_retries, "Execution failed"
                );
            }
            phase = phase.next(&state, max_retries);
        };

        let result = match outcome {
            Ok(PipelinePhase::Done) => match (state.summary.clone(), state.workspace_path()) {
                (Some(summary), Some(path)) => PipelineResult::Completed {
                    summary,
                    workspace_path: path.to_path_buf(),
                    attempt_count: state.attempt_count,
                    executions: state.executions(),
                },
                _ => self.failed(
                    &state,
                    FailureReason::InvalidState,
                    None,
                    "run finished without a summary".to_string(),
                ),
            },
            Ok(_) => self.failed(
                &state,
                FailureReason::RetryBudgetExhausted,
                None,
                "no diagnostics recorded".to_string(),
            ),
            Err((phase, e)) => {
                let reason = FailureReason::from(&e);
                if reason == FailureReason::Cancelled {
                    warn!(phase = ?phase, "Run cancelled");
                } else {
                    error!(phase = ?phase, error = %e, "Run aborted");
                }
                self.failed(&state, reason, phase.stage(), e.to_string())
            }
        };

        match &result {
            PipelineResult::Completed { executions, .. } => {
                info!(executions, attempt_count = state.attempt_count, "Pipeline completed")
            }
            PipelineResult::Failed { reason, executions, .. } => {
                info!(reason = %reason, executions, "Pipeline failed")
            }
        }

        let report = RunReport {
            run_id: state.run_id().to_string(),
            request: request.to_string(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
            plan: state.plan.clone(),
            resource_descriptor: state.resource_descriptor.clone(),
            attempts: state.attempts.clone(),
            result,
        };
        save_report(&state, &report);
        report
    }

    async fn step(
        &self,
        phase: PipelinePhase,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let stage: &dyn Stage = match phase {
            PipelinePhase::Setup => {
                let workspace = self.provisioner.provision()?;
                return state.set_workspace(workspace);
            }
            PipelinePhase::Planning => &self.planning,
            PipelinePhase::Discovery => &self.discovery,
            PipelinePhase::Synthesis => &self.synthesis,
            PipelinePhase::Execution => &self.execution,
            PipelinePhase::Repair => &self.repair,
            PipelinePhase::Summarization => &self.summarization,
            PipelinePhase::Done | PipelinePhase::Aborted => return Ok(()),
        };

        info!(stage = %stage.kind(), attempt_count = state.attempt_count, "Stage started");
        stage.apply(state, cancel).await?;
        info!(stage = %stage.kind(), "Stage finished");
        Ok(())
    }

    fn failed(
        &self,
        state: &PipelineState,
        reason: FailureReason,
        failed_stage: Option<StageKind>,
        fallback_text: String,
    ) -> PipelineResult {
        let last_diagnostics = match (reason, state.last_failure_diagnostics.as_deref()) {
            (_, None) => fallback_text,
            (FailureReason::RetryBudgetExhausted, Some(diagnostics)) => diagnostics.to_string(),
            // A fatal error after a failed execution keeps that execution's
            // diagnostics under the error line.
            (_, Some(diagnostics)) => format!("{}\n{}", fallback_text, diagnostics),
        };

        PipelineResult::Failed {
            reason,
            last_diagnostics,
            failed_stage,
            workspace_path: state.workspace_path().map(|p| p.to_path_buf()),
            attempt_count: state.attempt_count,
            executions: state.executions(),
        }
    }
}

/// Writes the report into the workspace. Failures are logged only.
fn save_report(state: &PipelineState, report: &RunReport) {
    let Ok(workspace) = state.workspace() else {
        return;
    };
    let json = match serde_json::to_vec_pretty(report) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Failed to serialize run report");
            return;
        }
    };
    match workspace.write_file(RUN_REPORT_FILE, &json) {
        Ok(path) => info!(path = %path.display(), "Run report saved"),
        Err(e) => warn!(error = %e, "Failed to save run report"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ProcessOutcome;
    use std::path::PathBuf;

    fn result_with(success: bool, artifacts: usize) -> ExecutionResult {
        ExecutionResult {
            success,
            exit_code: Some(if success { 0 } else { 1 }),
            stdout: String::new(),
            stderr: String::new(),
            fault: None,
            artifacts: (0..artifacts).map(|i| PathBuf::from(format!("a{}", i))).collect(),
            success_override: false,
            duration_ms: 0,
        }
    }

    #[test]
    fn test_routing_is_exhaustive_over_success_and_artifacts() {
        for success in [false, true] {
            for artifacts in [0, 1] {
                let route = route_after_execution(&result_with(success, artifacts));
                let expected = if success || artifacts > 0 {
                    ExecutionRoute::Success
                } else {
                    ExecutionRoute::Failure
                };
                assert_eq!(route, expected, "success={success} artifacts={artifacts}");
            }
        }
    }

    #[test]
    fn test_linear_transitions() {
        let state = PipelineState::new("r", "x");
        assert_eq!(PipelinePhase::Setup.next(&state, 2), PipelinePhase::Planning);
        assert_eq!(PipelinePhase::Planning.next(&state, 2), PipelinePhase::Discovery);
        assert_eq!(PipelinePhase::Discovery.next(&state, 2), PipelinePhase::Synthesis);
        assert_eq!(PipelinePhase::Synthesis.next(&state, 2), PipelinePhase::Execution);
        assert_eq!(PipelinePhase::Repair.next(&state, 2), PipelinePhase::Execution);
        assert_eq!(PipelinePhase::Summarization.next(&state, 2), PipelinePhase::Done);
        assert_eq!(PipelinePhase::Done.next(&state, 2), PipelinePhase::Done);
        assert_eq!(PipelinePhase::Aborted.next(&state, 2), PipelinePhase::Aborted);
    }

    #[test]
    fn test_execution_transition_respects_budget() {
        let mut state = PipelineState::new("r", "x");
        state.execution_result = Some(ExecutionResult::reconcile(
            ProcessOutcome::exited(1, "", "boom"),
            vec![],
        ));

        for (attempt_count, expected) in [
            (1, PipelinePhase::Repair),
            (2, PipelinePhase::Repair),
            (3, PipelinePhase::Aborted),
        ] {
            state.attempt_count = attempt_count;
            assert_eq!(PipelinePhase::Execution.next(&state, 2), expected);
        }

        state.attempt_count = 1;
        assert_eq!(PipelinePhase::Execution.next(&state, 0), PipelinePhase::Aborted);
    }

    #[test]
    fn test_execution_success_goes_to_summarization() {
        let mut state = PipelineState::new("r", "x");
        state.execution_result = Some(result_with(true, 0));
        state.attempt_count = 99;
        assert_eq!(PipelinePhase::Execution.next(&state, 0), PipelinePhase::Summarization);
    }

    #[test]
    fn test_phase_stage_mapping() {
        assert_eq!(PipelinePhase::Setup.stage(), None);
        assert_eq!(PipelinePhase::Repair.stage(), Some(StageKind::Repair));
        assert!(PipelinePhase::Aborted.is_terminal());
        assert!(!PipelinePhase::Execution.is_terminal());
    }
}
