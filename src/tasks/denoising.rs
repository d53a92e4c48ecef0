//! Denoising stage.
//!
//! Removes acquisition noise from the diffusion-weighted image. Three
//! algorithm variants: `nlmeans` runs in-process on loaded array data
//! (sigma estimated per slice and reduced by median), while `aonlm` and
//! `lpca` render a matlab script from a template and run it through the
//! external tool. When the external tool is unavailable the stage records
//! a warning and produces nothing rather than failing the pipeline.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::artifact::{build_name, Images};
use crate::dispatch::{
    gunzip_file, gzip_file, render_script, Algorithm, ScriptInvoker, ScriptParams,
    ScriptTemplate,
};
use crate::error::{ConfigError, DispatchError, TaskError};
use crate::qa::QaRenderer;
use crate::task::{Task, TaskContext};
use crate::volume::{estimate_noise, nlmeans, Volume, VolumeStore};

/// Stage name; doubles as the working directory name.
pub const NAME: &str = "denoising";

/// Directory roles this stage depends on. `eddy` is the primary upstream
/// producer; `parcellation` and `qa` are declared for future requirement
/// checks, matching the stage's contract.
pub const ROLES: [&str; 5] = ["eddy", "preparation", "parcellation", "fieldmap", "qa"];

pub struct Denoising {
    ctx: TaskContext,
    algorithm: Algorithm,
    invoker: Arc<dyn ScriptInvoker>,
    store: Arc<dyn VolumeStore>,
    renderer: Arc<dyn QaRenderer>,
    matlab_warning: bool,
}

impl Denoising {
    /// Builds the stage, resolving its algorithm variant from the
    /// configuration view.
    pub fn new(
        ctx: TaskContext,
        invoker: Arc<dyn ScriptInvoker>,
        store: Arc<dyn VolumeStore>,
        renderer: Arc<dyn QaRenderer>,
    ) -> Result<Self, ConfigError> {
        let name = ctx.settings().algorithm_name().to_string();
        let algorithm = Algorithm::parse(&name).ok_or(ConfigError::UnknownAlgorithm {
            task: NAME.to_string(),
            value: name,
        })?;

        Ok(Self {
            ctx,
            algorithm,
            invoker,
            store,
            renderer,
            matlab_warning: false,
        })
    }

    /// The ordered input fallback chain: prefer the most-downstream
    /// producer already available.
    pub fn input_candidates() -> [(&'static str, &'static [&'static str], &'static str); 3] {
        [
            ("fieldmap", &["dwi", "unwarp"] as &[&str], "fieldmap corrected"),
            ("eddy", &["dwi", "eddy"], "eddy corrected"),
            ("preparation", &["dwi"], "diffusion weighted"),
        ]
    }

    /// Resolves the input image along the fallback chain.
    fn dwi_image(&self) -> Option<PathBuf> {
        Self::input_candidates().into_iter().find_map(|(role, tags, _)| {
            let dir = self.ctx.role(role).ok()?;
            self.ctx.image(dir, tags)
        })
    }

    fn candidate_images(&self) -> Images {
        Images::from_pairs(Self::input_candidates().into_iter().map(
            |(role, tags, description)| {
                let found = self
                    .ctx
                    .role(role)
                    .ok()
                    .and_then(|dir| self.ctx.image(dir, tags));
                (found, description)
            },
        ))
    }

    fn run_nlmeans(&self, dwi: &Path, target: &Path) -> Result<(), TaskError> {
        let volume = self.store.load(dwi)?;
        let estimate = estimate_noise(&volume, self.ctx.settings().number_array_coil);
        info!("sigma value that will be applied to nlmeans = {}", estimate.sigma);

        let denoised = nlmeans(&volume, estimate.sigma);
        self.store.save(&denoised, target)?;

        let mask_target = build_name(target, &["noise_mask"], None);
        self.store
            .save(&Volume::from_mask(&estimate.mask), &mask_target)?;

        if let Some(noise_mask) = self.ctx.image(self.ctx.working_dir(), &["noise_mask"]) {
            let mask_png = build_name(&noise_mask, &[], Some("png"));
            self.renderer.slice_image(dwi, &mask_png, Some(&noise_mask))?;
        }
        let sigma_png = self.ctx.target(dwi, &["sigma"], Some("png"));
        self.renderer.plot_sigma(&estimate.per_slice, &sigma_png)?;

        Ok(())
    }

    async fn run_external(
        &mut self,
        template: ScriptTemplate,
        dwi: &Path,
        target: &Path,
    ) -> Result<(), TaskError> {
        if !self.ctx.general().matlab_available {
            self.matlab_warning = true;
            warn!(
                "Algorithm {} is set but matlab is not available for this server. \
                 Please configure matlab or set the denoising algorithm to nlmeans or none",
                self.algorithm.as_str()
            );
            return Ok(());
        }

        let uncompressed = self.uncompress_into_working(dwi)?;
        let tmp = self.ctx.target(&uncompressed, &["tmp"], Some("nii"));
        let script = self.create_script(template, &uncompressed, &tmp)?;

        info!("Launching {} denoising from matlab", template.name());
        let exit = self
            .invoker
            .invoke(&script, None, self.ctx.settings().timeout())
            .await
            .map_err(TaskError::from)?;
        if !exit.is_success() {
            return Err(DispatchError::NonZeroExit {
                code: exit.exit_code,
                stderr: exit.stderr,
            }
            .into());
        }

        info!("compressing {} image", tmp.display());
        let compressed = gzip_file(&tmp)?;
        fs::rename(&compressed, target)?;

        if self.ctx.settings().effective_cleanup(self.ctx.general()) {
            info!("Removing redundant image {}", uncompressed.display());
            fs::remove_file(&uncompressed)?;
        }
        Ok(())
    }

    /// Copies the compressed input next to the stage's outputs and
    /// decompresses it there; upstream directories are never written to.
    fn uncompress_into_working(&self, dwi: &Path) -> Result<PathBuf, TaskError> {
        let file_name = dwi
            .file_name()
            .ok_or_else(|| TaskError::MissingInput(dwi.display().to_string()))?;
        let local = self.ctx.working_dir().join(file_name);
        fs::copy(dwi, &local)?;
        let uncompressed = gunzip_file(&local)?;
        fs::remove_file(&local)?;
        Ok(uncompressed)
    }

    fn create_script(
        &self,
        template: ScriptTemplate,
        source: &Path,
        target: &Path,
    ) -> Result<PathBuf, TaskError> {
        let script = self
            .ctx
            .working_dir()
            .join(format!("{}.m", self.ctx.settings().script_name));
        info!("Creating denoising script {}", script.display());

        let params = ScriptParams {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            working_dir: self.ctx.working_dir().to_path_buf(),
            beta: self.ctx.settings().beta,
            rician: self.ctx.settings().rician,
            nb_threads: self.ctx.general().nb_threads,
        };
        let content = render_script(template, &params).map_err(TaskError::from)?;
        fs::write(&script, content)?;
        Ok(script)
    }
}

#[async_trait]
impl Task for Denoising {
    fn name(&self) -> &str {
        NAME
    }

    fn is_ignore(&self) -> bool {
        self.algorithm.is_none() || self.ctx.settings().ignore
    }

    fn meet_requirement(&self) -> bool {
        let candidates = self.candidate_images();
        if !candidates.any_present() {
            warn!(
                "No denoising input available; missing: {}",
                candidates.missing().join(", ")
            );
        }
        candidates.any_present()
    }

    fn is_dirty(&self) -> Images {
        Images::from_pairs([(
            self.ctx.image(self.ctx.working_dir(), &["dwi", "denoise"]),
            "denoised",
        )])
    }

    async fn implement(&mut self) -> Result<(), TaskError> {
        let dwi = self
            .dwi_image()
            .ok_or_else(|| TaskError::MissingInput("diffusion weighted image".to_string()))?;
        let target = self.ctx.target(&dwi, &["denoise"], None);

        match self.algorithm {
            Algorithm::None => {}
            Algorithm::Nlmeans => self.run_nlmeans(&dwi, &target)?,
            Algorithm::External(template) => self.run_external(template, &dwi, &target).await?,
        }

        // QA renderings for whatever output exists after the run; the
        // degraded external path produces none.
        if let Some(denoised) = self.ctx.image(self.ctx.working_dir(), &["dwi", "denoise"]) {
            let gif = build_name(&denoised, &[], Some("gif"));
            let compare = build_name(&denoised, &["compare"], Some("gif"));
            let brain_mask = self
                .ctx
                .role("eddy")
                .ok()
                .and_then(|dir| self.ctx.image(dir, &["mask", "eddy"]));
            self.renderer
                .animation(&denoised, &gif, brain_mask.as_deref())?;
            self.renderer
                .animation_compare(&dwi, &denoised, &compare, brain_mask.as_deref())?;
        }
        Ok(())
    }

    fn qa_supplier(&self) -> Images {
        let working = self.ctx.working_dir();
        let denoise_gif = self.ctx.image_with_ext(working, &["dwi", "denoise"], "gif");
        let compare_gif = self.ctx.image_with_ext(working, &["dwi", "compare"], "gif");

        let mut images = Images::from_pairs([
            (denoise_gif, "Denoised diffusion image"),
            (compare_gif, "Before and after denoising"),
        ]);

        let mut message = format!("Algorithm {} is set", self.algorithm.as_str());
        if self.matlab_warning {
            message.push_str(" but matlab is not available on this server");
        }
        images.set_information(message);

        let extras = [
            ("sigma", "Sigmas from nlmeans"),
            ("noise_mask", "Noise mask from nlmeans"),
        ];
        for (tag, description) in extras {
            if let Some(png) = self.ctx.image_with_ext(working, &[tag], "png") {
                images.extend(Images::from_pairs([(Some(png), description)]));
            }
        }

        images
    }
}
