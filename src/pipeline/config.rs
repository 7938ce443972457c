//! Pipeline configuration.
//!
//! Values come from, in increasing priority: defaults, a YAML file
//! ([`PipelineConfig::from_yaml_file`]), `AUTODEV_*` environment variables
//! ([`PipelineConfig::from_env`]), and finally CLI flags via the builder
//! methods.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::llm::DEFAULT_MODEL;
use crate::runner::{ExecutionConfig, DEFAULT_EXECUTION_TIMEOUT, DEFAULT_INTERPRETER};
use crate::stages::execution::{DEFAULT_MAX_DIAGNOSTICS_CHARS, DEFAULT_PROGRAM_FILE};
use crate::stages::{ExecutionOptions, GenerationSettings};

/// Configuration for the pipeline engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // Retry loop
    /// Repairs allowed after the first failed execution.
    pub max_retries: u32,

    // Execution settings
    /// Wall-clock budget for each execution attempt.
    #[serde(rename = "execution_timeout_secs", with = "duration_secs")]
    pub execution_timeout: Duration,
    /// Directory under which per-run workspaces are created.
    pub workspace_root: PathBuf,
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub program_file_name: String,
    pub clear_artifacts_before_attempt: bool,
    /// Diagnostics handed to repair are cut to this many trailing chars.
    pub max_diagnostics_chars: usize,

    // Batch settings
    pub max_concurrent_runs: usize,

    // LLM settings
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            workspace_root: PathBuf::from("./projects"),
            interpreter: DEFAULT_INTERPRETER.to_string(),
            interpreter_args: Vec::new(),
            program_file_name: DEFAULT_PROGRAM_FILE.to_string(),
            clear_artifacts_before_attempt: true,
            max_diagnostics_chars: DEFAULT_MAX_DIAGNOSTICS_CHARS,
            max_concurrent_runs: 2,
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.2,
            max_tokens: 4096,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `AUTODEV_MAX_RETRIES`: repairs allowed per run (default: 2)
    /// - `AUTODEV_EXECUTION_TIMEOUT_SECS`: per-attempt timeout (default: 1800)
    /// - `AUTODEV_WORKSPACE_ROOT`: workspace parent directory (default: ./projects)
    /// - `AUTODEV_INTERPRETER`: program interpreter (default: python3)
    /// - `AUTODEV_MODEL`: LLM model id
    /// - `AUTODEV_TEMPERATURE`: LLM temperature (default: 0.2)
    /// - `AUTODEV_MAX_TOKENS`: LLM max tokens (default: 4096)
    /// - `AUTODEV_CLEAR_ARTIFACTS`: clear `artifacts/` before each attempt (default: true)
    /// - `AUTODEV_MAX_CONCURRENT_RUNS`: batch concurrency (default: 2)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().merge_env(|key| std::env::var(key).ok())
    }

    /// Loads a YAML file whose keys mirror this struct; missing keys keep
    /// their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlays `AUTODEV_*` values from `lookup` onto `self`.
    pub fn merge_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("AUTODEV_MAX_RETRIES") {
            self.max_retries = parse_env_value(&val, "AUTODEV_MAX_RETRIES")?;
        }
        if let Some(val) = lookup("AUTODEV_EXECUTION_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "AUTODEV_EXECUTION_TIMEOUT_SECS")?;
            self.execution_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("AUTODEV_WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(val);
        }
        if let Some(val) = lookup("AUTODEV_INTERPRETER") {
            self.interpreter = val;
        }
        if let Some(val) = lookup("AUTODEV_MODEL") {
            self.model = val;
        }
        if let Some(val) = lookup("AUTODEV_TEMPERATURE") {
            self.temperature = parse_env_value(&val, "AUTODEV_TEMPERATURE")?;
        }
        if let Some(val) = lookup("AUTODEV_MAX_TOKENS") {
            self.max_tokens = parse_env_value(&val, "AUTODEV_MAX_TOKENS")?;
        }
        if let Some(val) = lookup("AUTODEV_CLEAR_ARTIFACTS") {
            self.clear_artifacts_before_attempt = parse_env_bool(&val, "AUTODEV_CLEAR_ARTIFACTS")?;
        }
        if let Some(val) = lookup("AUTODEV_MAX_CONCURRENT_RUNS") {
            self.max_concurrent_runs = parse_env_value(&val, "AUTODEV_MAX_CONCURRENT_RUNS")?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "execution_timeout must be greater than 0".to_string(),
            ));
        }
        if self.interpreter.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "interpreter cannot be empty".to_string(),
            ));
        }
        if self.program_file_name.trim().is_empty()
            || self.program_file_name.contains(|c: char| c == '/' || c == '\\')
        {
            return Err(ConfigError::ValidationFailed(
                "program_file_name must be a bare file name".to_string(),
            ));
        }
        if self.max_concurrent_runs == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_runs must be greater than 0".to_string(),
            ));
        }
        if self.max_diagnostics_chars == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_diagnostics_chars must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_tokens must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Builder method to set the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
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

    pub fn with_program_file_name(mut self, name: impl Into<String>) -> Self {
        self.program_file_name = name.into();
        self
    }

    pub fn with_clear_artifacts(mut self, clear: bool) -> Self {
        self.clear_artifacts_before_attempt = clear;
        self
    }

    pub fn with_max_concurrent_runs(mut self, runs: usize) -> Self {
        self.max_concurrent_runs = runs;
        self
    }

    /// Builder method to set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Builder method to set temperature.
    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Process settings for [`ProcessExecutor`](crate::runner::ProcessExecutor).
    pub fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig::new(self.interpreter.clone())
            .with_interpreter_args(self.interpreter_args.clone())
            .with_timeout(self.execution_timeout)
    }

    pub fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            program_file_name: self.program_file_name.clone(),
            clear_artifacts_before_attempt: self.clear_artifacts_before_attempt,
            max_diagnostics_chars: self.max_diagnostics_chars,
        }
    }

    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings::default()
            .with_model(self.model.clone())
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
