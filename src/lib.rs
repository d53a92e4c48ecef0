//! dwiforge: per-subject diffusion MRI pipeline.
//!
//! This library provides the task orchestration core of a multi-stage
//! imaging pipeline: deterministic artifact naming and tag-based lookup,
//! the five-operation stage lifecycle, algorithm dispatch (in-process or
//! through an external scriptable tool), and the per-subject runner with
//! incremental re-runs and QA reporting.

// Core modules
pub mod artifact;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod qa;
pub mod runner;
pub mod task;
pub mod tasks;
pub mod volume;

// Re-export commonly used error types
pub use error::{ConfigError, DispatchError, RunnerError, TaskError};
