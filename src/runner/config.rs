//! Configuration for program execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default wall-clock budget: training jobs routinely take minutes.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(1800);

pub const DEFAULT_INTERPRETER: &str = "python3";

/// Per-stream capture limit; only the tail is kept beyond this.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// How the process executor launches a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Interpreter binary; the program path is passed as its last argument.
    pub interpreter: String,
    /// Arguments placed between the interpreter and the program path.
    pub interpreter_args: Vec<String>,
    /// Maximum wall-clock time before the process group is killed.
    pub timeout: Duration,
    /// Extra environment variables for the child.
    pub env_vars: Vec<(String, String)>,
    pub max_output_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            interpreter: DEFAULT_INTERPRETER.to_string(),
            interpreter_args: Vec::new(),
            timeout: DEFAULT_EXECUTION_TIMEOUT,
            env_vars: Vec::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl ExecutionConfig {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            ..Default::default()
        }
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interpreter_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interpreter_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes.max(1);
        self
    }
}
