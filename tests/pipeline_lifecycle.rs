//! End-to-end lifecycle tests against a real subject directory tree.

use std::fs;

use ndarray::Array4;
use tempfile::TempDir;

use dwiforge::config::PipelineConfig;
use dwiforge::runner::{PipelineRunner, StageStatus};
use dwiforge::tasks::build_pipeline;
use dwiforge::volume::{RawGzStore, Volume, VolumeStore};

fn seed_eddy_input(subject: &std::path::Path) {
    let eddy = subject.join("eddy");
    fs::create_dir_all(&eddy).unwrap();

    let mut data = Array4::zeros((6, 6, 4, 3));
    data[(3, 3, 2, 0)] = 80.0;
    data[(3, 3, 2, 1)] = 75.0;
    data[(3, 3, 2, 2)] = 82.0;
    RawGzStore
        .save(&Volume::new(data), &eddy.join("dwi_eddy.nii.gz"))
        .unwrap();
}

fn nlmeans_config() -> PipelineConfig {
    PipelineConfig::from_yaml("tasks:\n  denoising:\n    algorithm: nlmeans\n").unwrap()
}

#[tokio::test]
async fn full_run_executes_denoising_and_blocks_atlas_registration() {
    let tmp = TempDir::new().unwrap();
    seed_eddy_input(tmp.path());
    let config = nlmeans_config();

    let stages = build_pipeline(tmp.path(), &config).unwrap();
    let report = PipelineRunner::new().run(tmp.path(), stages).await;

    assert!(!report.halted);
    assert_eq!(report.stages.len(), 2);

    // Denoising ran and produced its tagged artifacts.
    assert_eq!(report.stages[0].stage, "denoising");
    assert_eq!(report.stages[0].status, StageStatus::Executed);
    let working = tmp.path().join("denoising");
    assert!(working.join("dwi_eddy_denoise.nii.gz").exists());
    assert!(working.join("dwi_eddy_denoise_noise_mask.nii.gz").exists());

    // Atlas registration has no upstream inputs: blocked, not failed.
    assert_eq!(report.stages[1].stage, "atlas_registration");
    assert_eq!(report.stages[1].status, StageStatus::Blocked);
}

#[tokio::test]
async fn second_run_is_incremental() {
    let tmp = TempDir::new().unwrap();
    seed_eddy_input(tmp.path());
    let config = nlmeans_config();

    let stages = build_pipeline(tmp.path(), &config).unwrap();
    let first = PipelineRunner::new().run(tmp.path(), stages).await;
    assert_eq!(first.stages[0].status, StageStatus::Executed);

    let stages = build_pipeline(tmp.path(), &config).unwrap();
    let second = PipelineRunner::new().run(tmp.path(), stages).await;

    assert_eq!(second.stages[0].status, StageStatus::AlreadyDone);
    // QA is still reported for a completed stage.
    let qa = second.stages[0].qa.as_ref().unwrap();
    assert!(qa.information().unwrap().contains("nlmeans"));

    let json = serde_json::to_string(&second).unwrap();
    assert!(json.contains("already_done"));
}

#[tokio::test]
async fn ignored_pipeline_touches_nothing() {
    let tmp = TempDir::new().unwrap();
    seed_eddy_input(tmp.path());
    let config =
        PipelineConfig::from_yaml("tasks:\n  denoising:\n    algorithm: none\n").unwrap();

    let stages = build_pipeline(tmp.path(), &config).unwrap();
    let report = PipelineRunner::new().run(tmp.path(), stages).await;

    assert_eq!(report.stages[0].status, StageStatus::Ignored);
    assert_eq!(fs::read_dir(tmp.path().join("denoising")).unwrap().count(), 0);
}
