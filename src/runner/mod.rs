//! Per-subject pipeline runner.
//!
//! Drives the ordered stage list through the lifecycle contract. Per
//! stage the decision is a four-branch state machine — ignored, blocked,
//! already-done, executed — with a fifth terminal outcome (failed) when
//! `implement` raises. There are no retries at this layer; a failure
//! halts the subject's remaining stages.
//!
//! Execution is strictly sequential within a subject: stages discover
//! their inputs by scanning the previous stages' directories, so running
//! dependent stages concurrently could observe partially written
//! artifacts. Independent subjects are isolated trees and may be driven
//! concurrently by an outer caller.

use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifact::Images;
use crate::task::Task;

/// Outcome of one stage for one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Switched off by configuration; no side effects, no QA entry.
    Ignored,
    /// An upstream requirement is unmet; skipped, pipeline continues.
    Blocked,
    /// Outputs already present; `implement` skipped, QA still collected.
    AlreadyDone,
    /// `implement` ran to completion.
    Executed,
    /// `implement` raised; the subject's remaining stages are halted.
    Failed,
}

/// Report for one stage.
#[derive(Debug, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub status: StageStatus,
    /// Failure or QA status message, when there is one.
    pub message: Option<String>,
    /// QA artifacts, absent for ignored and blocked stages.
    pub qa: Option<Images>,
    pub duration_ms: u64,
}

/// Report for one subject run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub subject: String,
    pub started_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,
    /// True when a stage failure stopped the pipeline early.
    pub halted: bool,
}

impl RunReport {
    pub fn failed(&self) -> bool {
        self.stages
            .iter()
            .any(|stage| stage.status == StageStatus::Failed)
    }
}

/// Drives one subject's stages in declared order.
#[derive(Debug, Default)]
pub struct PipelineRunner;

impl PipelineRunner {
    pub fn new() -> Self {
        Self
    }

    /// Runs `stages` in order against `subject_dir` and reports every
    /// outcome. Never returns early except on stage failure, which halts
    /// the remaining stages for this subject.
    pub async fn run(&self, subject_dir: &Path, mut stages: Vec<Box<dyn Task>>) -> RunReport {
        let run_id = Uuid::new_v4();
        let subject = subject_dir.display().to_string();

        info!("Starting run {} for subject {}", run_id, subject);

        let mut report = RunReport {
            run_id,
            subject,
            started_at: Utc::now(),
            stages: Vec::with_capacity(stages.len()),
            halted: false,
        };

        for stage in &mut stages {
            let stage_report = Self::run_stage(stage.as_mut()).await;
            let failed = stage_report.status == StageStatus::Failed;
            report.stages.push(stage_report);

            if failed {
                report.halted = true;
                warn!("Run {} halted; remaining stages skipped", run_id);
                break;
            }
        }

        info!(
            "Run {} finished: {} stage(s) evaluated, halted={}",
            run_id,
            report.stages.len(),
            report.halted
        );
        report
    }

    async fn run_stage(stage: &mut dyn Task) -> StageReport {
        let name = stage.name().to_string();
        let start = Instant::now();

        if stage.is_ignore() {
            info!("Skipping {}: ignored by configuration", name);
            return StageReport {
                stage: name,
                status: StageStatus::Ignored,
                message: None,
                qa: None,
                duration_ms: elapsed_ms(start),
            };
        }

        if !stage.meet_requirement() {
            warn!("Skipping {}: requirement not met", name);
            return StageReport {
                stage: name,
                status: StageStatus::Blocked,
                message: Some("requirement not met".to_string()),
                qa: None,
                duration_ms: elapsed_ms(start),
            };
        }

        if stage.is_dirty().all_present() {
            info!("Skipping {}: outputs already present", name);
            let qa = stage.qa_supplier();
            return StageReport {
                stage: name,
                status: StageStatus::AlreadyDone,
                message: qa.information().map(str::to_string),
                qa: Some(qa),
                duration_ms: elapsed_ms(start),
            };
        }

        info!("Running {}", name);
        match stage.implement().await {
            Ok(()) => {
                let qa = stage.qa_supplier();
                info!("{} completed in {:?}", name, start.elapsed());
                StageReport {
                    stage: name,
                    status: StageStatus::Executed,
                    message: qa.information().map(str::to_string),
                    qa: Some(qa),
                    duration_ms: elapsed_ms(start),
                }
            }
            Err(e) => {
                error!("{} failed: {}", name, e);
                StageReport {
                    stage: name,
                    status: StageStatus::Failed,
                    message: Some(e.to_string()),
                    qa: None,
                    duration_ms: elapsed_ms(start),
                }
            }
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
