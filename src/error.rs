//! Error types for dwiforge operations.
//!
//! Defines error types for the major subsystems:
//! - Configuration loading and validation
//! - Stage execution (the only lifecycle operation allowed to fail)
//! - External algorithm dispatch (script rendering, process invocation)
//!
//! Absence of an upstream artifact is never an error: the lifecycle
//! predicates express it through boolean / image-set state, and the runner
//! reports it as a blocked stage.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while loading or validating pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file '{0}' not found")]
    FileNotFound(PathBuf),

    #[error("Unknown algorithm '{value}' for task '{task}': must be 'none', 'nlmeans', 'aonlm' or 'lpca'")]
    UnknownAlgorithm { task: String, value: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur during external algorithm dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to spawn external tool '{command}': {message}")]
    SpawnFailed { command: String, message: String },

    #[error("External tool timed out after {0:?}")]
    Timeout(Duration),

    #[error("External tool exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Script template rendering error: {0}")]
    Template(#[from] tera::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a stage's `implement` step.
///
/// These are the unrecoverable failures: anything that surfaces here halts
/// the remaining stages for the subject. Blocked, already-done and
/// degraded-mode outcomes never take this path.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Directory role '{0}' was not declared by this stage")]
    UnresolvedRole(String),

    #[error("Required input disappeared between requirement check and execution: {0}")]
    MissingInput(String),

    #[error("Malformed input data in '{path}': {message}")]
    MalformedInput { path: PathBuf, message: String },

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while setting up a subject run.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Subject directory '{0}' does not exist")]
    SubjectNotFound(PathBuf),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
