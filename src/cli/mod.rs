//! Command-line interface for taskpilot.
//!
//! Provides commands for starting and resuming pipeline runs, answering
//! posted questions, and inspecting or resetting the circuit breaker.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
