//! Run orchestration.
//!
//! A run provisions a fresh workspace, then walks the stage graph:
//! planning, resource discovery and program synthesis once each, followed
//! by an execute/repair loop bounded by `max_retries`, and a final
//! summarization when an execution succeeds.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use autodev::llm::LiteLlmClient;
//! use autodev::pipeline::{PipelineConfig, PipelineEngine};
//!
//! let llm = Arc::new(LiteLlmClient::from_env()?);
//! let engine = PipelineEngine::with_process_executor(llm, PipelineConfig::from_env()?)?;
//!
//! let result = engine.run("Predict house prices from the Ames housing data").await;
//! if let Some(summary) = result.summary() {
//!     println!("{}", summary.summary_text);
//! }
//! ```

pub mod config;
pub mod engine;
pub mod result;
pub mod state;

pub use config::PipelineConfig;
pub use engine::{route_after_execution, ExecutionRoute, PipelineEngine, PipelinePhase};
pub use result::{AttemptRecord, FailureReason, PipelineResult, RunReport, RUN_REPORT_FILE};
pub use state::PipelineState;
