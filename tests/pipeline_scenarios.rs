//! End-to-end pipeline scenarios driven through the public API with a
//! scripted language model and a scripted program executor.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use autodev::error::LlmError;
use autodev::llm::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
use autodev::pipeline::{FailureReason, PipelineConfig, PipelineEngine, PipelineResult, RUN_REPORT_FILE};
use autodev::prompts::{DISCOVERY_SYSTEM, PLANNING_SYSTEM, REPAIR_SYSTEM, SYNTHESIS_SYSTEM};
use autodev::runner::{ProcessOutcome, ProgramExecutor};
use autodev::stages::{StageKind, SummarySource};
use autodev::workspace::Workspace;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const PLAN_JSON: &str = r#"{"problem": "classify iris species", "dataset_requirements": "tabular", "model_family": "random forest", "metrics": "accuracy, f1", "notes": ""}"#;
const DATASET_JSON: &str = r#"{"dataset": {"name": "iris", "hf_id": "scikit-learn/iris", "task": "classification", "target": "species"}}"#;
const SUMMARY_JSON: &str = r#"{"summary": "Model trained well", "metrics": {"accuracy": 0.91}, "insights": ["petal width dominates"], "recommendations": "try gradient boosting"}"#;
const TRAIN_PROGRAM: &str = "print('train')";
const FIXED_PROGRAM: &str = "print('fixed')";
const GOOD_OUTPUT: &str = "accuracy: 0.91\nEXECUTION_COMPLETE\n";

type Responder = dyn Fn(StageKind, &str) -> Result<String, LlmError> + Send + Sync;

/// Language model that answers per stage, identified by system prompt.
struct MockLlm {
    respond: Box<Responder>,
    calls: Mutex<Vec<(StageKind, String)>>,
}

impl MockLlm {
    fn new(respond: impl Fn(StageKind, &str) -> Result<String, LlmError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn standard() -> Arc<Self> {
        Self::new(standard_response)
    }

    fn prompts_for(&self, stage: StageKind) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _)| *kind == stage)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or_default()
}

fn stage_of(system: &str) -> StageKind {
    let line = first_line(system);
    if line == first_line(PLANNING_SYSTEM) {
        StageKind::Planning
    } else if line == first_line(DISCOVERY_SYSTEM) {
        StageKind::Discovery
    } else if line == first_line(SYNTHESIS_SYSTEM) {
        StageKind::Synthesis
    } else if line == first_line(REPAIR_SYSTEM) {
        StageKind::Repair
    } else {
        StageKind::Summarization
    }
}

fn standard_response(stage: StageKind, _user: &str) -> Result<String, LlmError> {
    Ok(match stage {
        StageKind::Planning => PLAN_JSON.to_string(),
        StageKind::Discovery => DATASET_JSON.to_string(),
        StageKind::Synthesis => TRAIN_PROGRAM.to_string(),
        StageKind::Repair => format!("```python\n{}\n```", FIXED_PROGRAM),
        _ => SUMMARY_JSON.to_string(),
    })
}

#[async_trait]
impl LlmProvider for MockLlm {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let system = request
            .messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let user = request
            .messages
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let stage = stage_of(&system);
        self.calls.lock().unwrap().push((stage, user.clone()));

        let text = (self.respond)(stage, &user)?;
        Ok(GenerationResponse {
            id: "mock".to_string(),
            model: "mock-model".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(text),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage::default(),
        })
    }
}

type Script = dyn Fn(usize, &str, &Workspace) -> ProcessOutcome + Send + Sync;

/// Executor whose outcome is decided by the call index and program text.
struct MockExecutor {
    script: Box<Script>,
    programs: Mutex<Vec<String>>,
}

impl MockExecutor {
    fn new(script: impl Fn(usize, &str, &Workspace) -> ProcessOutcome + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            programs: Mutex::new(Vec::new()),
        })
    }

    fn programs(&self) -> Vec<String> {
        self.programs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgramExecutor for MockExecutor {
    async fn run(&self, program_path: &Path, workspace: &Workspace, _cancel: &CancellationToken) -> ProcessOutcome {
        let program = std::fs::read_to_string(program_path).unwrap();
        let index = {
            let mut programs = self.programs.lock().unwrap();
            programs.push(program.clone());
            programs.len() - 1
        };
        (self.script)(index, &program, workspace)
    }
}

/// Executor that runs until the run is cancelled.
struct BlockingExecutor;

#[async_trait]
impl ProgramExecutor for BlockingExecutor {
    async fn run(&self, _program_path: &Path, _workspace: &Workspace, cancel: &CancellationToken) -> ProcessOutcome {
        cancel.cancelled().await;
        ProcessOutcome::cancelled("partial output")
    }
}

fn config(tmp: &TempDir, max_retries: u32) -> PipelineConfig {
    PipelineConfig::default()
        .with_workspace_root(tmp.path().join("projects"))
        .with_max_retries(max_retries)
}

fn engine(tmp: &TempDir, max_retries: u32, llm: Arc<MockLlm>, executor: Arc<dyn ProgramExecutor>) -> PipelineEngine {
    PipelineEngine::new(llm, executor, config(tmp, max_retries)).unwrap()
}

fn always_ok() -> Arc<MockExecutor> {
    MockExecutor::new(|_, _, _| ProcessOutcome::exited(0, GOOD_OUTPUT, ""))
}

fn always_fail() -> Arc<MockExecutor> {
    MockExecutor::new(|_, _, _| ProcessOutcome::exited(1, "", "ValueError: could not convert string to float"))
}

fn fixed_succeeds() -> Arc<MockExecutor> {
    MockExecutor::new(|_, program, _| {
        if program.contains("fixed") {
            ProcessOutcome::exited(0, GOOD_OUTPUT, "")
        } else {
            ProcessOutcome::exited(1, "", "KeyError: 'species'")
        }
    })
}

fn expect_failed(result: &PipelineResult) -> (FailureReason, &str, Option<StageKind>) {
    match result {
        PipelineResult::Failed {
            reason,
            last_diagnostics,
            failed_stage,
            ..
        } => (*reason, last_diagnostics.as_str(), *failed_stage),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_happy_path_executes_once() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::standard();
    let executor = MockExecutor::new(|_, _, workspace| {
        std::fs::write(workspace.artifacts_dir().join("model.pkl"), b"weights").unwrap();
        ProcessOutcome::exited(0, GOOD_OUTPUT, "")
    });
    let engine = engine(&tmp, 2, llm.clone(), executor.clone());

    let result = engine.run("Classify iris flowers").await;

    assert!(result.is_completed(), "{:?}", result);
    assert_eq!(result.executions(), 1);
    assert_eq!(result.attempt_count(), 0);
    assert_eq!(executor.programs(), vec![TRAIN_PROGRAM.to_string()]);

    let produced = Workspace::at(result.workspace_path().unwrap()).list_artifacts().unwrap();
    assert_eq!(produced, vec![std::path::PathBuf::from("model.pkl")]);
    let report = std::fs::read_to_string(result.workspace_path().unwrap().join(RUN_REPORT_FILE)).unwrap();
    let report: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert_eq!(report["attempts"][0]["artifacts"], 1);
    assert_eq!(report["attempts"][0]["success_override"], false);
    assert!(llm.prompts_for(StageKind::Repair).is_empty());

    let summary = result.summary().unwrap();
    assert_eq!(summary.summary_text, "Model trained well");
    assert_eq!(summary.metrics.get("accuracy"), Some(&0.91));
    assert_eq!(summary.source, SummarySource::Collaborator);

    let workspace = Workspace::at(result.workspace_path().unwrap());
    for dir in [workspace.dataset_dir(), workspace.models_dir(), workspace.code_dir(), workspace.artifacts_dir()] {
        assert!(dir.is_dir(), "{} missing", dir.display());
    }
    assert!(workspace.program_path("ml_pipeline.py").exists());
}

#[tokio::test]
async fn test_stage_prompts_carry_upstream_outputs() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::standard();
    let engine = engine(&tmp, 2, llm.clone(), always_ok());

    engine.run("Classify iris flowers").await;

    assert!(llm.prompts_for(StageKind::Planning)[0].contains("Classify iris flowers"));
    assert!(llm.prompts_for(StageKind::Discovery)[0].contains("classify iris species"));
    let synthesis = &llm.prompts_for(StageKind::Synthesis)[0];
    assert!(synthesis.contains("scikit-learn/iris"));
    assert!(llm.prompts_for(StageKind::Summarization)[0].contains("accuracy: 0.91"));
}

#[tokio::test]
async fn test_single_repair_then_success() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::standard();
    let executor = fixed_succeeds();
    let engine = engine(&tmp, 2, llm.clone(), executor.clone());

    let result = engine.run("Classify iris flowers").await;

    assert!(result.is_completed(), "{:?}", result);
    assert_eq!(result.executions(), 2);
    assert_eq!(result.attempt_count(), 1);
    assert_eq!(executor.programs(), vec![TRAIN_PROGRAM.to_string(), FIXED_PROGRAM.to_string()]);

    let repairs = llm.prompts_for(StageKind::Repair);
    assert_eq!(repairs.len(), 1);
    assert!(repairs[0].contains("[exit code 1]"));
    assert!(repairs[0].contains("KeyError: 'species'"));
    assert!(repairs[0].contains(TRAIN_PROGRAM));
}

#[tokio::test]
async fn test_retry_budget_exhaustion() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::standard();
    let executor = always_fail();
    let engine = engine(&tmp, 2, llm.clone(), executor.clone());

    let result = engine.run("Classify iris flowers").await;

    let (reason, diagnostics, stage) = expect_failed(&result);
    assert_eq!(reason, FailureReason::RetryBudgetExhausted);
    assert!(diagnostics.contains("could not convert string to float"));
    assert_eq!(stage, None);
    assert_eq!(result.executions(), 3);
    assert_eq!(executor.programs().len(), 3);
    assert_eq!(llm.prompts_for(StageKind::Repair).len(), 2);
    assert!(llm.prompts_for(StageKind::Summarization).is_empty());
    assert!(result.workspace_path().is_some());
}

#[tokio::test]
async fn test_zero_retries_means_single_execution() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::standard();
    let engine = engine(&tmp, 0, llm.clone(), always_fail());

    let result = engine.run("Classify iris flowers").await;

    assert_eq!(result.failure_reason(), Some(FailureReason::RetryBudgetExhausted));
    assert_eq!(result.executions(), 1);
    assert!(llm.prompts_for(StageKind::Repair).is_empty());
}

#[tokio::test]
async fn test_timeout_is_routed_to_repair() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::standard();
    let executor = MockExecutor::new(|index, _, _| {
        if index == 0 {
            ProcessOutcome::timed_out(Duration::from_secs(5), "epoch 1/100")
        } else {
            ProcessOutcome::exited(0, GOOD_OUTPUT, "")
        }
    });
    let engine = engine(&tmp, 2, llm.clone(), executor);

    let result = engine.run("Classify iris flowers").await;

    assert!(result.is_completed(), "{:?}", result);
    assert_eq!(result.attempt_count(), 1);
    let repairs = llm.prompts_for(StageKind::Repair);
    assert_eq!(repairs.len(), 1);
    assert!(repairs[0].contains("[timeout]"));
}

#[tokio::test]
async fn test_launch_fault_is_routed_to_repair() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::standard();
    let executor = MockExecutor::new(|index, _, _| {
        if index == 0 {
            ProcessOutcome::launch_fault("failed to launch 'python3': No such file or directory")
        } else {
            ProcessOutcome::exited(0, GOOD_OUTPUT, "")
        }
    });
    let engine = engine(&tmp, 1, llm.clone(), executor);

    let result = engine.run("Classify iris flowers").await;

    assert!(result.is_completed(), "{:?}", result);
    assert!(llm.prompts_for(StageKind::Repair)[0].contains("[environment fault]"));
}

#[tokio::test]
async fn test_artifacts_override_nonzero_exit() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::standard();
    let executor = MockExecutor::new(|_, _, workspace| {
        std::fs::write(workspace.artifacts_dir().join("model.pkl"), b"weights").unwrap();
        ProcessOutcome::exited(1, GOOD_OUTPUT, "Exception ignored in atexit callback")
    });
    let engine = engine(&tmp, 2, llm.clone(), executor);

    let result = engine.run("Classify iris flowers").await;

    assert!(result.is_completed(), "{:?}", result);
    assert_eq!(result.executions(), 1);
    assert_eq!(result.attempt_count(), 0);
    assert!(llm.prompts_for(StageKind::Repair).is_empty());
}

#[tokio::test]
async fn test_each_run_gets_a_unique_workspace() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp, 2, MockLlm::standard(), always_ok());

    let first = engine.run("Classify iris flowers").await;
    let second = engine.run("Classify iris flowers").await;

    let a = first.workspace_path().unwrap();
    let b = second.workspace_path().unwrap();
    assert_ne!(a, b);
    assert_eq!(a.parent(), b.parent());
    assert!(a.file_name().unwrap().to_string_lossy().starts_with("project_"));
    assert!(a.is_dir() && b.is_dir());
}

#[tokio::test]
async fn test_unparseable_summary_falls_back_to_local_extraction() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::new(|stage, user| match stage {
        StageKind::Summarization => Ok("The model did great, congratulations!".to_string()),
        other => standard_response(other, user),
    });
    let engine = engine(&tmp, 2, llm, always_ok());

    let result = engine.run("Classify iris flowers").await;

    assert!(result.is_completed(), "{:?}", result);
    let summary = result.summary().unwrap();
    assert_eq!(summary.source, SummarySource::Local);
    assert_eq!(summary.metrics.get("accuracy"), Some(&0.91));
}

#[tokio::test]
async fn test_summary_collaborator_outage_still_completes() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::new(|stage, user| match stage {
        StageKind::Summarization => Err(LlmError::RequestFailed("connection reset".to_string())),
        other => standard_response(other, user),
    });
    let engine = engine(&tmp, 2, llm, always_ok());

    let result = engine.run("Classify iris flowers").await;

    assert!(result.is_completed());
    assert_eq!(result.summary().unwrap().source, SummarySource::Local);
}

#[tokio::test]
async fn test_malformed_plan_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::new(|stage, user| match stage {
        StageKind::Planning => Ok("Sure! I would start by looking at the data.".to_string()),
        other => standard_response(other, user),
    });
    let executor = always_ok();
    let engine = engine(&tmp, 2, llm.clone(), executor.clone());

    let result = engine.run("Classify iris flowers").await;

    let (reason, _, stage) = expect_failed(&result);
    assert_eq!(reason, FailureReason::MalformedCollaboratorOutput);
    assert_eq!(stage, Some(StageKind::Planning));
    assert_eq!(result.executions(), 0);
    assert!(executor.programs().is_empty());
    assert!(llm.prompts_for(StageKind::Discovery).is_empty());
    assert!(result.workspace_path().is_some());
}

#[tokio::test]
async fn test_discovery_collaborator_error_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::new(|stage, user| match stage {
        StageKind::Discovery => Err(LlmError::RateLimited("quota".to_string())),
        other => standard_response(other, user),
    });
    let engine = engine(&tmp, 2, llm, always_ok());

    let result = engine.run("Classify iris flowers").await;

    let (reason, diagnostics, stage) = expect_failed(&result);
    assert_eq!(reason, FailureReason::Collaborator);
    assert_eq!(stage, Some(StageKind::Discovery));
    assert!(diagnostics.contains("quota"));
}

#[tokio::test]
async fn test_empty_repair_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::new(|stage, user| match stage {
        StageKind::Repair => Ok("   ".to_string()),
        other => standard_response(other, user),
    });
    let engine = engine(&tmp, 2, llm, fixed_succeeds());

    let result = engine.run("Classify iris flowers").await;

    let (reason, diagnostics, stage) = expect_failed(&result);
    assert_eq!(reason, FailureReason::RepairFailed);
    assert_eq!(stage, Some(StageKind::Repair));
    assert_eq!(result.executions(), 1);

    // The error line comes first, then the failed execution's output.
    assert!(diagnostics.starts_with("Repair failed"), "{}", diagnostics);
    assert!(diagnostics.contains("[exit code 1]"));
    assert!(diagnostics.contains("KeyError: 'species'"));

    let report = std::fs::read_to_string(result.workspace_path().unwrap().join(RUN_REPORT_FILE)).unwrap();
    let report: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert!(report["result"]["last_diagnostics"]
        .as_str()
        .unwrap()
        .contains("KeyError: 'species'"));
}

#[tokio::test]
async fn test_fatal_error_before_execution_has_no_execution_diagnostics() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::new(|stage, user| match stage {
        StageKind::Synthesis => Ok(String::new()),
        other => standard_response(other, user),
    });
    let engine = engine(&tmp, 2, llm, always_fail());

    let result = engine.run("Classify iris flowers").await;

    let (reason, diagnostics, stage) = expect_failed(&result);
    assert_eq!(reason, FailureReason::MalformedCollaboratorOutput);
    assert_eq!(stage, Some(StageKind::Synthesis));
    assert!(!diagnostics.contains("[exit code"));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let tmp = TempDir::new().unwrap();
    let executor = always_ok();
    let engine = engine(&tmp, 2, MockLlm::standard(), executor.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = engine.run_with_cancel("Classify iris flowers", &cancel).await;

    assert_eq!(result.failure_reason(), Some(FailureReason::Cancelled));
    assert_eq!(result.executions(), 0);
    assert!(executor.programs().is_empty());
}

#[tokio::test]
async fn test_cancelled_during_execution() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::standard();
    let engine = engine(&tmp, 2, llm.clone(), Arc::new(BlockingExecutor));
    let cancel = CancellationToken::new();

    let (result, _) = tokio::join!(engine.run_with_cancel("Classify iris flowers", &cancel), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let (reason, _, stage) = expect_failed(&result);
    assert_eq!(reason, FailureReason::Cancelled);
    assert_eq!(stage, Some(StageKind::Execution));
    assert_eq!(result.executions(), 1);
    assert!(llm.prompts_for(StageKind::Repair).is_empty());
}

#[tokio::test]
async fn test_run_report_is_written() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp, 2, MockLlm::standard(), fixed_succeeds());

    let result = engine.run("Classify iris flowers").await;

    let path = result.workspace_path().unwrap().join(RUN_REPORT_FILE);
    let report: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(report["request"], "Classify iris flowers");
    assert_eq!(report["result"]["status"], "completed");
    assert_eq!(report["plan"]["problem"], "classify iris species");
    assert_eq!(report["resource_descriptor"]["hf_id"], "scikit-learn/iris");

    let attempts = report["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0]["success"], false);
    assert_eq!(attempts[1]["success"], true);
    assert_ne!(attempts[0]["program_digest"], attempts[1]["program_digest"]);
}

#[tokio::test]
async fn test_batch_runs_are_isolated() {
    let tmp = TempDir::new().unwrap();
    let llm = MockLlm::new(|stage, user| match stage {
        StageKind::Planning => {
            let topic = ["alpha", "beta", "gamma"]
                .into_iter()
                .find(|t| user.contains(t))
                .unwrap_or("unknown");
            Ok(format!(r#"{{"problem": "{}", "metrics": ["accuracy"]}}"#, topic))
        }
        StageKind::Synthesis => {
            let topic = ["alpha", "beta", "gamma"]
                .into_iter()
                .find(|t| user.contains(t))
                .unwrap_or("unknown");
            Ok(format!("print('{}')", topic))
        }
        StageKind::Repair => {
            // Keep the topic so the executor can keep failing "beta".
            let topic = if user.contains("beta") { "beta" } else { "other" };
            Ok(format!("print('{} fixed')", topic))
        }
        other => standard_response(other, user),
    });
    let executor = MockExecutor::new(|_, program, _| {
        if program.contains("beta") {
            ProcessOutcome::exited(1, "", "beta always fails")
        } else {
            ProcessOutcome::exited(0, GOOD_OUTPUT, "")
        }
    });
    let engine = engine(&tmp, 1, llm, executor);
    let requests = vec![
        "request alpha".to_string(),
        "request beta".to_string(),
        "request gamma".to_string(),
    ];

    let results = engine.run_batch(&requests, &CancellationToken::new()).await;

    assert_eq!(results.len(), 3);
    assert!(results[0].is_completed());
    assert_eq!(results[1].failure_reason(), Some(FailureReason::RetryBudgetExhausted));
    assert_eq!(results[1].executions(), 2);
    assert!(results[2].is_completed());
    assert_eq!(results[0].executions(), 1);

    let mut paths: Vec<_> = results.iter().map(|r| r.workspace_path().unwrap().to_path_buf()).collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 3);
}

#[tokio::test]
async fn test_empty_batch() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp, 2, MockLlm::standard(), always_ok());
    assert!(engine.run_batch(&[], &CancellationToken::new()).await.is_empty());
}

#[test]
fn test_engine_rejects_invalid_config() {
    let tmp = TempDir::new().unwrap();
    let invalid = [
        config(&tmp, 2).with_program_file_name(""),
        config(&tmp, 2).with_program_file_name("code/train.py"),
        config(&tmp, 2).with_execution_timeout(Duration::ZERO),
        config(&tmp, 2).with_max_concurrent_runs(0),
    ];

    for config in invalid {
        let built = PipelineEngine::new(MockLlm::standard(), always_ok(), config.clone());
        assert!(built.is_err(), "accepted {:?}", config);
    }

    // Nothing was provisioned for a rejected configuration.
    assert!(!tmp.path().join("projects").exists());
}
