//! CLI command definitions and handlers.

use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::RunnerError;
use crate::runner::PipelineRunner;
use crate::tasks::{build_pipeline, inspect_pipeline};

#[derive(Debug, Parser)]
#[command(name = "dwiforge", version, about = "Per-subject diffusion MRI pipeline")]
pub struct Cli {
    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Runs the pipeline for one subject.
    Run {
        /// Subject directory containing the stage directories.
        #[arg(long)]
        subject: PathBuf,

        /// Global configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Per-subject configuration overlay.
        #[arg(long)]
        subject_config: Option<PathBuf>,

        /// Write the JSON run report here instead of stdout.
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Prints the QA image sets of a subject's existing working tree.
    Qa {
        /// Subject directory containing the stage directories.
        #[arg(long)]
        subject: PathBuf,

        /// Global configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Per-subject configuration overlay.
        #[arg(long)]
        subject_config: Option<PathBuf>,
    },
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run {
            subject,
            config,
            subject_config,
            report,
        } => run_subject(subject, config, subject_config, report).await,
        Commands::Qa {
            subject,
            config,
            subject_config,
        } => print_qa(subject, config, subject_config),
    }
}

async fn run_subject(
    subject: PathBuf,
    config: PathBuf,
    subject_config: Option<PathBuf>,
    report_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    if !subject.is_dir() {
        return Err(RunnerError::SubjectNotFound(subject).into());
    }

    let config = PipelineConfig::load(&config, subject_config.as_deref())?;
    let stages = build_pipeline(&subject, &config)?;
    let report = PipelineRunner::new().run(&subject, stages).await;

    let json = serde_json::to_string_pretty(&report)?;
    match report_path {
        Some(path) => {
            fs::write(&path, json)?;
            info!("Run report written to {}", path.display());
        }
        None => println!("{json}"),
    }

    if report.failed() {
        anyhow::bail!("pipeline failed for subject {}", report.subject);
    }
    Ok(())
}

fn print_qa(
    subject: PathBuf,
    config: PathBuf,
    subject_config: Option<PathBuf>,
) -> anyhow::Result<()> {
    if !subject.is_dir() {
        return Err(RunnerError::SubjectNotFound(subject).into());
    }

    let config = PipelineConfig::load(&config, subject_config.as_deref())?;
    let stages = inspect_pipeline(&subject, &config)?;

    for stage in &stages {
        if stage.is_ignore() {
            continue;
        }
        let entry = serde_json::json!({
            "stage": stage.name(),
            "qa": stage.qa_supplier(),
        });
        println!("{entry}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_parses() {
        let cli = Cli::try_parse_from([
            "dwiforge",
            "run",
            "--subject",
            "/data/s01",
            "--config",
            "config.yaml",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                subject, config, ..
            } => {
                assert_eq!(subject, PathBuf::from("/data/s01"));
                assert_eq!(config, PathBuf::from("config.yaml"));
            }
            _ => panic!("expected run command"),
        }
    }
}
