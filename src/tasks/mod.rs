//! Concrete pipeline stages.
//!
//! Each stage is an instance of the [`Task`](crate::task::Task) contract;
//! `build_pipeline` assembles them in pipeline order with the production
//! collaborators wired in.

pub mod atlas_registration;
pub mod denoising;

use std::path::Path;
use std::sync::Arc;

use crate::artifact::FsLookup;
use crate::config::PipelineConfig;
use crate::dispatch::MatlabInvoker;
use crate::error::RunnerError;
use crate::qa::TextRenderer;
use crate::task::{Task, TaskContext};
use crate::volume::RawGzStore;

pub use atlas_registration::{AtlasRegistration, ExternalRegistration, RegistrationOps};
pub use denoising::Denoising;

/// Builds the subject's stages in pipeline order with production
/// collaborators.
pub fn build_pipeline(
    subject_dir: &Path,
    config: &PipelineConfig,
) -> Result<Vec<Box<dyn Task>>, RunnerError> {
    assemble(subject_dir, config, true)
}

/// Assembles the same stages without creating any stage or role
/// directories, for read-only inspection of an existing working tree.
pub fn inspect_pipeline(
    subject_dir: &Path,
    config: &PipelineConfig,
) -> Result<Vec<Box<dyn Task>>, RunnerError> {
    assemble(subject_dir, config, false)
}

fn assemble(
    subject_dir: &Path,
    config: &PipelineConfig,
    create_dirs: bool,
) -> Result<Vec<Box<dyn Task>>, RunnerError> {
    let lookup = Arc::new(FsLookup);
    let renderer = Arc::new(TextRenderer);
    let resolve = |name: &str, roles: &[&str]| {
        if create_dirs {
            TaskContext::resolve(subject_dir, name, roles, config, lookup.clone())
        } else {
            TaskContext::locate(subject_dir, name, roles, config, lookup.clone())
        }
    };

    let denoising = Denoising::new(
        resolve(denoising::NAME, &denoising::ROLES)?,
        Arc::new(MatlabInvoker::new()),
        Arc::new(RawGzStore),
        renderer.clone(),
    )?;

    let registration_timeout = config.task(atlas_registration::NAME).timeout();
    let atlas = AtlasRegistration::new(
        resolve(atlas_registration::NAME, &atlas_registration::ROLES)?,
        Arc::new(ExternalRegistration::new(registration_timeout)),
        renderer,
    );

    Ok(vec![Box::new(denoising), Box::new(atlas)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build_pipeline_orders_stages() {
        let tmp = TempDir::new().unwrap();
        let config = PipelineConfig::default();

        let stages = build_pipeline(tmp.path(), &config).unwrap();
        let names: Vec<_> = stages.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["denoising", "atlas_registration"]);
    }

    #[test]
    fn test_inspect_pipeline_creates_no_directories() {
        let tmp = TempDir::new().unwrap();
        let config = PipelineConfig::default();

        inspect_pipeline(tmp.path(), &config).unwrap();
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_build_pipeline_creates_directory_roles() {
        let tmp = TempDir::new().unwrap();
        let config = PipelineConfig::default();

        build_pipeline(tmp.path(), &config).unwrap();
        for role in ["denoising", "eddy", "preparation", "fieldmap", "atlas"] {
            assert!(tmp.path().join(role).is_dir(), "missing {role}");
        }
    }
}
