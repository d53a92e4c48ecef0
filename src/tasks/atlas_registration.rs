//! Atlas registration stage.
//!
//! Brings the standard-space atlases (brodmann, aal2, networks7) into the
//! subject's diffusion space: each atlas is registered with the mrtrix
//! transformation matrix and resampled onto the upsampled b0 grid with
//! the freesurfer-to-DWI matrix. The transforms themselves run through
//! the [`RegistrationOps`] collaborator.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::artifact::{build_name, Images};
use crate::error::{DispatchError, TaskError};
use crate::qa::QaRenderer;
use crate::task::{Task, TaskContext};

/// Stage name; doubles as the working directory name.
pub const NAME: &str = "atlas_registration";

/// Directory roles this stage depends on.
pub const ROLES: [&str; 3] = ["atlas", "upsampling", "registration"];

/// Atlases processed by this stage, with their QA descriptions.
const ATLASES: [(&str, &str); 3] = [
    ("brodmann", "Brodmann segmentation on upsampled b0"),
    ("aal2", "Aal2 segmentation on upsampled b0"),
    ("networks7", "Resting state seven networks segmentation on upsampled b0"),
];

/// Seam for the external registration and resampling transforms.
#[async_trait]
pub trait RegistrationOps: Send + Sync {
    /// Applies a mrtrix transformation matrix to an atlas volume.
    async fn apply_registration(
        &self,
        atlas: &Path,
        matrix: &Path,
        target: &Path,
    ) -> Result<(), TaskError>;

    /// Resamples an atlas onto a reference grid through a transformation
    /// matrix; `nearest` selects nearest-neighbour interpolation, which
    /// label volumes require.
    async fn apply_resample(
        &self,
        atlas: &Path,
        reference: &Path,
        matrix: &Path,
        target: &Path,
        nearest: bool,
    ) -> Result<(), TaskError>;
}

/// Production transforms backed by the mrtrix and fsl command-line tools.
pub struct ExternalRegistration {
    mrtransform: String,
    flirt: String,
    timeout: Duration,
}

impl ExternalRegistration {
    pub fn new(timeout: Duration) -> Self {
        Self {
            mrtransform: "mrtransform".to_string(),
            flirt: "flirt".to_string(),
            timeout,
        }
    }

    async fn run_tool(&self, command: &str, args: &[String]) -> Result<(), TaskError> {
        info!("Running {} {}", command, args.join(" "));

        let mut cmd = Command::new(command);
        cmd.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| DispatchError::Timeout(self.timeout))?
            .map_err(|e| DispatchError::SpawnFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(DispatchError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl RegistrationOps for ExternalRegistration {
    async fn apply_registration(
        &self,
        atlas: &Path,
        matrix: &Path,
        target: &Path,
    ) -> Result<(), TaskError> {
        let args = vec![
            "-linear".to_string(),
            matrix.display().to_string(),
            atlas.display().to_string(),
            target.display().to_string(),
        ];
        self.run_tool(&self.mrtransform, &args).await
    }

    async fn apply_resample(
        &self,
        atlas: &Path,
        reference: &Path,
        matrix: &Path,
        target: &Path,
        nearest: bool,
    ) -> Result<(), TaskError> {
        let mut args = vec![
            "-in".to_string(),
            atlas.display().to_string(),
            "-ref".to_string(),
            reference.display().to_string(),
            "-applyxfm".to_string(),
            "-init".to_string(),
            matrix.display().to_string(),
            "-out".to_string(),
            target.display().to_string(),
        ];
        if nearest {
            args.push("-interp".to_string());
            args.push("nearestneighbour".to_string());
        }
        self.run_tool(&self.flirt, &args).await
    }
}

pub struct AtlasRegistration {
    ctx: TaskContext,
    registration: Arc<dyn RegistrationOps>,
    renderer: Arc<dyn QaRenderer>,
}

impl AtlasRegistration {
    pub fn new(
        ctx: TaskContext,
        registration: Arc<dyn RegistrationOps>,
        renderer: Arc<dyn QaRenderer>,
    ) -> Self {
        Self {
            ctx,
            registration,
            renderer,
        }
    }

    fn upsampled_b0(&self) -> Option<PathBuf> {
        let dir = self.ctx.role("upsampling").ok()?;
        self.ctx.image(dir, &["b0", "upsample"])
    }

    fn registration_matrix(&self, tags: &[&str]) -> Option<PathBuf> {
        let dir = self.ctx.role("registration").ok()?;
        self.ctx.image_with_ext(dir, tags, "mat")
    }

    fn atlas_image(&self, name: &str) -> Option<PathBuf> {
        let dir = self.ctx.role("atlas").ok()?;
        self.ctx.image(dir, &[name])
    }

    /// Brain mask used as the QA field of view, produced upstream.
    fn brain_mask(&self) -> Option<PathBuf> {
        let dir = self.ctx.role("registration").ok()?;
        self.ctx.image(dir, &["mask", "resample"])
    }

    /// The full strict requirement set: the upsampled b0, both
    /// transformation matrices and every atlas.
    fn required_inputs(&self) -> Images {
        let mut images = Images::from_pairs([
            (self.upsampled_b0(), "upsampled b0"),
            (
                self.registration_matrix(&["freesurfer_dwi", "transformation", "mrtrix"]),
                "mrtrix transformation matrix",
            ),
            (
                self.registration_matrix(&["freesurfer_dwi", "transformation"]),
                "freesurfer to DWI transformation matrix",
            ),
        ]);
        for (name, _) in ATLASES {
            images.push(self.atlas_image(name), format!("{name} atlas"));
        }
        images
    }
}

#[async_trait]
impl Task for AtlasRegistration {
    fn name(&self) -> &str {
        NAME
    }

    fn is_ignore(&self) -> bool {
        self.ctx.settings().ignore
    }

    fn meet_requirement(&self) -> bool {
        let inputs = self.required_inputs();
        if !inputs.all_present() {
            warn!(
                "Atlas registration inputs missing: {}",
                inputs.missing().join(", ")
            );
        }
        inputs.all_present()
    }

    fn is_dirty(&self) -> Images {
        Images::from_pairs(ATLASES.map(|(name, _)| {
            (
                self.ctx.image(self.ctx.working_dir(), &[name, "resample"]),
                format!("{name} atlas resample"),
            )
        }))
    }

    async fn implement(&mut self) -> Result<(), TaskError> {
        let missing = |what: &str| TaskError::MissingInput(what.to_string());
        let b0 = self.upsampled_b0().ok_or_else(|| missing("upsampled b0"))?;
        let mrtrix_matrix = self
            .registration_matrix(&["freesurfer_dwi", "transformation", "mrtrix"])
            .ok_or_else(|| missing("mrtrix transformation matrix"))?;
        let freesurfer_to_dwi = self
            .registration_matrix(&["freesurfer_dwi", "transformation"])
            .ok_or_else(|| missing("freesurfer to DWI transformation matrix"))?;

        let brain_mask = self.brain_mask();

        for (name, _) in ATLASES {
            let atlas = self
                .atlas_image(name)
                .ok_or_else(|| missing(&format!("{name} atlas")))?;

            let register = self.ctx.target(&atlas, &["register"], None);
            self.registration
                .apply_registration(&atlas, &mrtrix_matrix, &register)
                .await?;

            let resample = self.ctx.target(&atlas, &["resample"], None);
            self.registration
                .apply_resample(&atlas, &b0, &freesurfer_to_dwi, &resample, true)
                .await?;

            let qa_png = build_name(&resample, &["qa"], Some("png"));
            self.renderer
                .volume_overlay(&b0, &resample, brain_mask.as_deref(), &qa_png)?;
        }
        Ok(())
    }

    fn qa_supplier(&self) -> Images {
        let working = self.ctx.working_dir();
        let mut images = Images::from_pairs(ATLASES.map(|(name, description)| {
            (
                self.ctx.image_with_ext(working, &[name, "qa"], "png"),
                description,
            )
        }));
        images.set_information("Atlases registered and resampled on the upsampled b0");
        images
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::FsLookup;
    use crate::config::PipelineConfig;
    use crate::qa::TextRenderer;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeRegistration {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RegistrationOps for FakeRegistration {
        async fn apply_registration(
            &self,
            _atlas: &Path,
            _matrix: &Path,
            target: &Path,
        ) -> Result<(), TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            fs::write(target, b"registered").unwrap();
            Ok(())
        }

        async fn apply_resample(
            &self,
            _atlas: &Path,
            _reference: &Path,
            _matrix: &Path,
            target: &Path,
            nearest: bool,
        ) -> Result<(), TaskError> {
            assert!(nearest, "label volumes resample with nearest neighbour");
            self.calls.fetch_add(1, Ordering::SeqCst);
            fs::write(target, b"resampled").unwrap();
            Ok(())
        }
    }

    fn stage(subject: &Path, ops: Arc<FakeRegistration>) -> AtlasRegistration {
        let ctx = TaskContext::resolve(
            subject,
            NAME,
            &ROLES,
            &PipelineConfig::default(),
            Arc::new(FsLookup),
        )
        .unwrap();
        AtlasRegistration::new(ctx, ops, Arc::new(TextRenderer))
    }

    fn seed_inputs(subject: &Path) {
        let upsampling = subject.join("upsampling");
        let registration = subject.join("registration");
        let atlas = subject.join("atlas");
        for dir in [&upsampling, &registration, &atlas] {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(upsampling.join("b0_upsample.nii.gz"), b"x").unwrap();
        fs::write(
            registration.join("freesurfer_dwi_transformation.mat"),
            b"x",
        )
        .unwrap();
        fs::write(
            registration.join("freesurfer_dwi_transformation_mrtrix.mat"),
            b"x",
        )
        .unwrap();
        for name in ["brodmann", "aal2", "networks7"] {
            fs::write(atlas.join(format!("{name}.nii.gz")), b"x").unwrap();
        }
    }

    #[test]
    fn test_requirement_needs_every_input() {
        let tmp = TempDir::new().unwrap();
        let stage = stage(
            tmp.path(),
            Arc::new(FakeRegistration {
                calls: AtomicUsize::new(0),
            }),
        );
        assert!(!stage.meet_requirement());

        seed_inputs(tmp.path());
        assert!(stage.meet_requirement());
    }

    #[test]
    fn test_matrix_lookup_distinguishes_mrtrix_variant() {
        let tmp = TempDir::new().unwrap();
        seed_inputs(tmp.path());
        let stage = stage(
            tmp.path(),
            Arc::new(FakeRegistration {
                calls: AtomicUsize::new(0),
            }),
        );

        let plain = stage
            .registration_matrix(&["freesurfer_dwi", "transformation"])
            .unwrap();
        let mrtrix = stage
            .registration_matrix(&["freesurfer_dwi", "transformation", "mrtrix"])
            .unwrap();

        assert!(plain.to_string_lossy().ends_with("transformation.mat"));
        assert!(mrtrix.to_string_lossy().ends_with("mrtrix.mat"));
    }

    #[tokio::test]
    async fn test_implement_registers_and_resamples_each_atlas() {
        let tmp = TempDir::new().unwrap();
        seed_inputs(tmp.path());
        let ops = Arc::new(FakeRegistration {
            calls: AtomicUsize::new(0),
        });
        let mut stage = stage(tmp.path(), ops.clone());

        assert!(!stage.is_dirty().all_present());
        stage.implement().await.unwrap();

        // One registration and one resample per atlas.
        assert_eq!(ops.calls.load(Ordering::SeqCst), 6);
        let working = tmp.path().join(NAME);
        for name in ["brodmann", "aal2", "networks7"] {
            assert!(working.join(format!("{name}_register.nii.gz")).exists());
            assert!(working.join(format!("{name}_resample.nii.gz")).exists());
            assert!(working.join(format!("{name}_resample_qa.png")).exists());
        }
        assert!(stage.is_dirty().all_present());

        let qa = stage.qa_supplier();
        assert!(qa.all_present());
        assert_eq!(qa.len(), 3);
    }
}
