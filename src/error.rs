//! Error types for autodev operations.
//!
//! Defines error types for the major subsystems:
//! - LLM API interactions
//! - Workspace provisioning and filesystem access
//! - Pipeline stage failures (the fatal half of the failure taxonomy)
//! - Configuration loading and validation
//!
//! Execution timeouts and launch faults are deliberately absent here: they
//! are recorded inside an [`ExecutionResult`](crate::runner::ExecutionResult)
//! and routed through the repair loop instead of unwinding the run.

use std::path::PathBuf;

use thiserror::Error;

use crate::stages::StageKind;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: LITELLM_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("LLM returned no content")]
    EmptyResponse,
}

/// Errors that can occur while provisioning or inspecting a workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to create workspace directory '{path}': {source}")]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not allocate a unique workspace name under '{root}' after {attempts} attempts")]
    NameExhausted { root: PathBuf, attempts: u32 },

    #[error("Failed to write '{path}': {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read directory '{path}': {source}")]
    ListFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to clear '{path}': {source}")]
    ClearFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fatal stage failures. Any of these aborts the whole run.
#[derive(Debug, Error)]
pub enum StageError {
    /// The collaborator answered, but neither strict parsing nor local
    /// salvage produced a usable structure.
    #[error("{stage} stage received malformed collaborator output: {detail}")]
    MalformedCollaboratorOutput { stage: StageKind, detail: String },

    /// The collaborator could not be reached or rejected the request.
    #[error("{stage} stage collaborator call failed: {source}")]
    Collaborator {
        stage: StageKind,
        #[source]
        source: LlmError,
    },

    /// Repair could not produce a revised program.
    #[error("Repair failed: {0}")]
    RepairFailed(String),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    /// A stage ran before the fields it reads were populated.
    #[error("Invalid pipeline state: {0}")]
    InvalidState(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl StageError {
    /// Builds a malformed-output error for `stage`.
    pub fn malformed(stage: StageKind, detail: impl Into<String>) -> Self {
        StageError::MalformedCollaboratorOutput {
            stage,
            detail: detail.into(),
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
