//! Command-line interface for autodev.
//!
//! Provides the `run`, `batch` and `summarize` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
