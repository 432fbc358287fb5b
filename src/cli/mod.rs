//! Command-line interface for autograsper.
//!
//! Provides the episode loop, standalone recording and the outcome summary.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
