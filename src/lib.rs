//! autodev: a self-repairing pipeline that turns a natural-language request
//! into an executed, artifact-producing program.
//!
//! A run provisions an isolated workspace, asks a language model for a
//! plan, a dataset and a program, executes the program, and on failure
//! feeds the diagnostics back for repair until it succeeds or the retry
//! budget is spent.

pub mod cli;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod runner;
pub mod stages;
pub mod utils;
pub mod workspace;

// Re-export commonly used types
pub use error::{ConfigError, LlmError, StageError, WorkspaceError};
pub use pipeline::{PipelineConfig, PipelineEngine, PipelineResult};
