//! Command-line interface for dwiforge.
//!
//! Provides commands for running a subject's pipeline and for printing
//! the QA summary of an existing working tree.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
