//! CLI command definitions for autodev.
//!
//! `run` drives a single request through the pipeline, `batch` runs one
//! request per line of a file concurrently, and `summarize` applies the
//! offline metric extraction to a captured output file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::llm::{LiteLlmClient, LlmProvider};
use crate::pipeline::{PipelineConfig, PipelineEngine, PipelineResult};
use crate::stages::summarize_locally;

/// Turn natural-language ML requests into executed, self-repairing programs.
#[derive(Parser)]
#[command(name = "autodev")]
#[command(about = "Plan, synthesize, run and repair ML programs from a natural-language request")]
#[command(version)]
#[command(
    long_about = "autodev provisions a fresh workspace per request, asks a language model for a plan, a dataset and a program, runs the program, and feeds failures back for repair until it succeeds or the retry budget is spent.\n\nExample usage:\n  autodev run \"Classify iris species\" --max-retries 3 --timeout 600"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run one request end to end.
    Run(RunArgs),

    /// Run every non-empty line of a file as an independent request.
    Batch(BatchArgs),

    /// Summarize a captured program output file without calling a model.
    Summarize(SummarizeArgs),
}

/// Settings shared by `run` and `batch`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct EngineArgs {
    /// Repairs allowed after the first failed execution.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Per-attempt execution timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Directory under which run workspaces are created.
    #[arg(long)]
    pub workspace_root: Option<PathBuf>,

    /// Interpreter used to run generated programs.
    #[arg(long)]
    pub interpreter: Option<String>,

    /// LLM model to use for every stage.
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// OpenRouter API key (can also be set via OPENROUTER_API_KEY env var).
    #[arg(long, env = "OPENROUTER_API_KEY")]
    pub api_key: Option<String>,

    /// YAML configuration file; flags override its values.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `autodev run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// The natural-language request.
    pub request: String,

    #[command(flatten)]
    pub engine: EngineArgs,
}

/// Arguments for `autodev batch`.
#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// File with one request per line.
    pub file: PathBuf,

    /// Maximum runs in flight at once.
    #[arg(long)]
    pub concurrency: Option<usize>,

    #[command(flatten)]
    pub engine: EngineArgs,
}

/// Arguments for `autodev summarize`.
#[derive(Parser, Debug)]
pub struct SummarizeArgs {
    /// Captured stdout of a program run.
    pub file: PathBuf,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_run_command(args).await,
        Commands::Batch(args) => run_batch_command(args).await,
        Commands::Summarize(args) => run_summarize_command(args),
    }
}

async fn run_run_command(args: RunArgs) -> anyhow::Result<()> {
    if args.request.trim().is_empty() {
        anyhow::bail!("request must not be empty");
    }

    let config = resolve_config(&args.engine)?;
    let engine = build_engine(&args.engine, config)?;
    let cancel = cancel_on_ctrl_c();

    let report = engine.run_report(&args.request, &cancel).await;
    if args.engine.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_result(&report.result);
    }

    if !report.result.is_completed() {
        anyhow::bail!("pipeline did not complete");
    }
    Ok(())
}

async fn run_batch_command(args: BatchArgs) -> anyhow::Result<()> {
    let requests = load_requests(&args.file)?;
    if requests.is_empty() {
        anyhow::bail!("no requests found in {}", args.file.display());
    }

    let mut config = resolve_config(&args.engine)?;
    if let Some(concurrency) = args.concurrency {
        config = config.with_max_concurrent_runs(concurrency);
    }
    config.validate()?;

    info!(
        requests = requests.len(),
        concurrency = config.max_concurrent_runs,
        "Starting batch"
    );
    let engine = build_engine(&args.engine, config)?;
    let cancel = cancel_on_ctrl_c();
    let results = engine.run_batch(&requests, &cancel).await;

    let completed = results.iter().filter(|r| r.is_completed()).count();
    if args.engine.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for (request, result) in requests.iter().zip(&results) {
            println!("== {}", request);
            print_result(result);
        }
        println!("{}/{} runs completed", completed, results.len());
    }

    batch_outcome(&results)
}

/// Fails the batch when any run did not complete, so the exit status
/// reflects partial failure.
fn batch_outcome(results: &[PipelineResult]) -> anyhow::Result<()> {
    let failed = results.iter().filter(|r| !r.is_completed()).count();
    if failed > 0 {
        warn!(failed, "Some runs failed");
        anyhow::bail!("{} of {} runs failed", failed, results.len());
    }
    Ok(())
}

fn run_summarize_command(args: SummarizeArgs) -> anyhow::Result<()> {
    let output = fs::read_to_string(&args.file)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", args.file.display(), e))?;
    let summary = summarize_locally(&output);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary.summary_text);
        for (name, value) in &summary.metrics {
            println!("  {}: {}", name, value);
        }
        println!("{}", summary.insights);
    }
    Ok(())
}

/// Defaults, then the YAML file, then `AUTODEV_*`, then flags.
fn resolve_config(args: &EngineArgs) -> anyhow::Result<PipelineConfig> {
    let base = match &args.config {
        Some(path) => PipelineConfig::from_yaml_file(path)?,
        None => PipelineConfig::default(),
    };
    let mut config = base.merge_env(|key| std::env::var(key).ok())?;

    if let Some(retries) = args.max_retries {
        config = config.with_max_retries(retries);
    }
    if let Some(secs) = args.timeout {
        config = config.with_execution_timeout(Duration::from_secs(secs));
    }
    if let Some(root) = &args.workspace_root {
        config = config.with_workspace_root(root.clone());
    }
    if let Some(interpreter) = &args.interpreter {
        config = config.with_interpreter(interpreter.clone());
    }
    if let Some(model) = &args.model {
        config = config.with_model(model.clone());
    }

    config.validate()?;
    Ok(config)
}

fn build_engine(args: &EngineArgs, config: PipelineConfig) -> anyhow::Result<PipelineEngine> {
    let llm = build_llm_client(args.api_key.clone(), &config.model)?;
    Ok(PipelineEngine::with_process_executor(llm, config)?)
}

/// `--api-key` / `OPENROUTER_API_KEY` selects OpenRouter; otherwise the
/// `LITELLM_*` variables describe the endpoint.
fn build_llm_client(api_key: Option<String>, model: &str) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let client = match api_key {
        Some(key) => {
            info!(model = %model, "Using OpenRouter with specified API key");
            LiteLlmClient::new_with_defaults(key)?
        }
        None => LiteLlmClient::from_env().map_err(|e| {
            anyhow::anyhow!(
                "{}.\nProvide --api-key <KEY>, set OPENROUTER_API_KEY, or set LITELLM_API_BASE.",
                e
            )
        })?,
    };
    Ok(Arc::new(client.with_default_model(model)))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            token.cancel();
        }
    });
    cancel
}

fn load_requests(path: &Path) -> anyhow::Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
    Ok(parse_requests(&contents))
}

/// Non-empty lines; `#` starts a comment line.
fn parse_requests(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn print_result(result: &PipelineResult) {
    match result {
        PipelineResult::Completed {
            summary,
            workspace_path,
            attempt_count,
            executions,
        } => {
            println!("Completed after {} execution(s), {} repair(s)", executions, attempt_count);
            println!("Workspace: {}", workspace_path.display());
            println!("{}", summary.summary_text);
            for (name, value) in &summary.metrics {
                println!("  {}: {}", name, value);
            }
            if !summary.insights.is_empty() {
                println!("Insights: {}", summary.insights);
            }
            if !summary.recommendations.is_empty() {
                println!("Recommendations: {}", summary.recommendations);
            }
        }
        PipelineResult::Failed {
            reason,
            last_diagnostics,
            failed_stage,
            workspace_path,
            executions,
            ..
        } => {
            match failed_stage {
                Some(stage) => println!("Failed in {} stage: {}", stage, reason),
                None => println!("Failed: {}", reason),
            }
            println!("Executions: {}", executions);
            if let Some(path) = workspace_path {
                println!("Workspace: {}", path.display());
            }
            if !last_diagnostics.is_empty() {
                println!("Last diagnostics:\n{}", last_diagnostics);
            }
        }
    }
}
