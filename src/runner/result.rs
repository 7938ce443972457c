//! Outcomes of executing a synthesized program.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Stderr recorded when the wall-clock budget is exceeded.
pub const TIMEOUT_MARKER: &str = "execution timed out";

/// Stderr recorded when the run is cancelled mid-execution.
pub const CANCELLED_MARKER: &str = "execution cancelled";

/// Why a process did not produce a normal exit status.
///
/// These are routed into the repair loop like a non-zero exit; they are
/// not errors of the pipeline itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFault {
    /// The process exceeded its time budget and was killed.
    TimedOut { after_secs: u64 },
    /// The process could not be launched at all (missing interpreter,
    /// permission denied, ...).
    EnvironmentFault { message: String },
    /// The run's cancellation token fired while the process was running.
    Cancelled,
}

impl fmt::Display for ExecutionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionFault::TimedOut { after_secs } => {
                write!(f, "timed out after {}s", after_secs)
            }
            ExecutionFault::EnvironmentFault { message } => {
                write!(f, "environment fault: {}", message)
            }
            ExecutionFault::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Raw result of one process invocation, before artifact reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` on timeout, cancellation, launch fault, or signal death.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub fault: Option<ExecutionFault>,
    pub duration: Duration,
}

impl ProcessOutcome {
    /// A process that ran to completion.
    pub fn exited(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// A process killed after `timeout`. The measured run time is set
    /// with [`with_duration`](Self::with_duration).
    pub fn timed_out(timeout: Duration, stdout: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            stdout: stdout.into(),
            stderr: TIMEOUT_MARKER.to_string(),
            fault: Some(ExecutionFault::TimedOut {
                after_secs: timeout.as_secs(),
            }),
            duration: Duration::ZERO,
        }
    }

    pub fn launch_fault(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: message.clone(),
            fault: Some(ExecutionFault::EnvironmentFault { message }),
            duration: Duration::ZERO,
        }
    }

    pub fn cancelled(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            stdout: stdout.into(),
            stderr: CANCELLED_MARKER.to_string(),
            fault: Some(ExecutionFault::Cancelled),
            duration: Duration::ZERO,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Exit status 0 with no fault.
    pub fn exited_cleanly(&self) -> bool {
        self.fault.is_none() && self.exit_code == Some(0)
    }
}

/// The recorded result of one Execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit 0, or artifacts were produced.
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<ExecutionFault>,
    /// Entries found under `artifacts/` after the process finished,
    /// relative to that directory.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    /// Set when artifacts turned a non-zero exit into a success.
    #[serde(default)]
    pub success_override: bool,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Combines a process outcome with the artifacts left on disk.
    ///
    /// Success is exit 0 OR a non-empty artifacts directory. When only the
    /// second holds, `success_override` is set so callers can log it.
    pub fn reconcile(outcome: ProcessOutcome, artifacts: Vec<PathBuf>) -> Self {
        let exited_cleanly = outcome.exited_cleanly();
        let has_artifacts = !artifacts.is_empty();

        Self {
            success: exited_cleanly || has_artifacts,
            success_override: !exited_cleanly && has_artifacts,
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            fault: outcome.fault,
            artifacts,
            duration_ms: outcome.duration.as_millis() as u64,
        }
    }

    pub fn has_artifacts(&self) -> bool {
        !self.artifacts.is_empty()
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.fault, Some(ExecutionFault::TimedOut { .. }))
    }

    /// Human-readable reason for an override, if one happened.
    pub fn override_reason(&self) -> Option<String> {
        if !self.success_override {
            return None;
        }
        let status = match (&self.fault, self.exit_code) {
            (Some(fault), _) => fault.to_string(),
            (None, Some(code)) => format!("exit code {}", code),
            (None, None) => "terminated by signal".to_string(),
        };
        Some(format!(
            "{} artifact(s) present despite {}",
            self.artifacts.len(),
            status
        ))
    }

    /// Text handed to the repair stage for a failed attempt.
    ///
    /// Uses stderr, or stdout when stderr is blank, keeps only the last
    /// `max_chars` characters, and prefixes a line naming how the process
    /// ended so timeouts and launch faults are not mistaken for crashes.
    pub fn diagnostics(&self, max_chars: usize) -> String {
        let header = match (&self.fault, self.exit_code) {
            (Some(ExecutionFault::TimedOut { after_secs }), _) => {
                format!("[timeout] program exceeded its {}s budget and was killed", after_secs)
            }
            (Some(ExecutionFault::EnvironmentFault { .. }), _) => {
                "[environment fault] the program could not be launched".to_string()
            }
            (Some(ExecutionFault::Cancelled), _) => "[cancelled] run was cancelled".to_string(),
            (None, Some(code)) => format!("[exit code {}]", code),
            (None, None) => "[terminated by signal]".to_string(),
        };

        let body = if self.stderr.trim().is_empty() {
            self.stdout.as_str()
        } else {
            self.stderr.as_str()
        };

        let body = tail_chars(body.trim_end(), max_chars);
        if body.is_empty() {
            header
        } else {
            format!("{}\n{}", header, body)
        }
    }
}

/// The last `max_chars` characters of `s`, on a char boundary.
pub fn tail_chars(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => "",
    }
}
