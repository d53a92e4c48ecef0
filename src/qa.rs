//! QA rendering seam.
//!
//! Slicing and plotting are the job of an external rendering collaborator;
//! the core only asks for renderings at canonical target paths and links
//! them into the QA image set. [`TextRenderer`] is the built-in backend:
//! it writes small textual manifests at the target paths so QA artifacts
//! exist on disk and downstream report tooling can link them.

use std::fs;
use std::path::Path;

use crate::error::TaskError;

/// Rendering operations a stage may request for its QA artifacts.
pub trait QaRenderer: Send + Sync {
    /// Renders an annotated slice image, optionally overlaying a mask.
    fn slice_image(
        &self,
        source: &Path,
        target: &Path,
        mask_overlay: Option<&Path>,
    ) -> Result<(), TaskError>;

    /// Renders an animated pass through the volume, optionally bounded by
    /// a brain mask.
    fn animation(
        &self,
        source: &Path,
        target: &Path,
        boundaries: Option<&Path>,
    ) -> Result<(), TaskError>;

    /// Renders a before/after comparison animation.
    fn animation_compare(
        &self,
        before: &Path,
        after: &Path,
        target: &Path,
        boundaries: Option<&Path>,
    ) -> Result<(), TaskError>;

    /// Plots per-slice sigma estimates.
    fn plot_sigma(&self, per_slice: &[f32], target: &Path) -> Result<(), TaskError>;

    /// Renders a segmentation overlay on a background volume, optionally
    /// restricted to a field of view.
    fn volume_overlay(
        &self,
        background: &Path,
        overlay: &Path,
        fov: Option<&Path>,
        target: &Path,
    ) -> Result<(), TaskError>;
}

/// Built-in renderer writing textual manifests in place of images.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextRenderer;

impl TextRenderer {
    fn write(&self, target: &Path, body: String) -> Result<(), TaskError> {
        fs::write(target, body)?;
        Ok(())
    }
}

impl QaRenderer for TextRenderer {
    fn slice_image(
        &self,
        source: &Path,
        target: &Path,
        mask_overlay: Option<&Path>,
    ) -> Result<(), TaskError> {
        let overlay = mask_overlay
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string());
        self.write(
            target,
            format!("slice source={} overlay={}\n", source.display(), overlay),
        )
    }

    fn animation(
        &self,
        source: &Path,
        target: &Path,
        boundaries: Option<&Path>,
    ) -> Result<(), TaskError> {
        let bounds = boundaries
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string());
        self.write(
            target,
            format!("animation source={} bounds={}\n", source.display(), bounds),
        )
    }

    fn animation_compare(
        &self,
        before: &Path,
        after: &Path,
        target: &Path,
        boundaries: Option<&Path>,
    ) -> Result<(), TaskError> {
        let bounds = boundaries
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string());
        self.write(
            target,
            format!(
                "compare before={} after={} bounds={}\n",
                before.display(),
                after.display(),
                bounds
            ),
        )
    }

    fn plot_sigma(&self, per_slice: &[f32], target: &Path) -> Result<(), TaskError> {
        let values: Vec<String> = per_slice.iter().map(|v| v.to_string()).collect();
        self.write(target, format!("sigma per slice: {}\n", values.join(", ")))
    }

    fn volume_overlay(
        &self,
        background: &Path,
        overlay: &Path,
        fov: Option<&Path>,
        target: &Path,
    ) -> Result<(), TaskError> {
        let fov = fov
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string());
        self.write(
            target,
            format!(
                "overlay background={} segmentation={} fov={}\n",
                background.display(),
                overlay.display(),
                fov
            ),
        )
    }
}
