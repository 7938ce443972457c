//! Program execution.
//!
//! The execution collaborator behind the pipeline's Execution stage:
//!
//! ```text
//! program text → code/<file> → interpreter (child process, own group)
//!                                 │
//!                 exit / timeout / cancel / launch fault
//!                                 │
//!              ProcessOutcome + artifacts/ listing → ExecutionResult
//! ```
//!
//! [`ProgramExecutor`] is the seam tests replace; [`ProcessExecutor`] is
//! the real implementation. Timeouts and launch faults are values
//! ([`ExecutionFault`]), never errors, so they flow into the repair loop.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use autodev::runner::{ExecutionConfig, ProcessExecutor};
//!
//! let executor = ProcessExecutor::new(
//!     ExecutionConfig::new("python3").with_timeout(Duration::from_secs(600)),
//! );
//! ```

pub mod config;
pub mod executor;
pub mod result;

pub use config::{
    ExecutionConfig, DEFAULT_EXECUTION_TIMEOUT, DEFAULT_INTERPRETER, DEFAULT_MAX_OUTPUT_BYTES,
};
pub use executor::{ProcessExecutor, ProgramExecutor};
pub use result::{
    tail_chars, ExecutionFault, ExecutionResult, ProcessOutcome, CANCELLED_MARKER, TIMEOUT_MARKER,
};
