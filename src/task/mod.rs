//! The stage contract.
//!
//! Every pipeline stage implements [`Task`]: four lifecycle predicates the
//! runner evaluates in a fixed order, plus the QA supplier. A stage is
//! constructed per subject from a [`TaskContext`], which resolves the
//! stage's declared directory roles to absolute paths (created when
//! absent) and carries the immutable configuration view and the lookup
//! seam.
//!
//! Stages own no persistent state beyond their working directory's
//! contents: re-constructing and re-running a stage against an unchanged
//! tree reports already-done and writes nothing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::artifact::{build_name, ImageLookup, Images};
use crate::config::{GeneralSettings, PipelineConfig, TaskSettings};
use crate::error::{RunnerError, TaskError};

/// Per-subject context a stage is constructed from.
pub struct TaskContext {
    name: String,
    working_dir: PathBuf,
    roles: BTreeMap<String, PathBuf>,
    settings: TaskSettings,
    general: GeneralSettings,
    lookup: Arc<dyn ImageLookup>,
}

impl TaskContext {
    /// Resolves a stage's directory roles under `subject_dir`.
    ///
    /// The working directory is `<subject>/<name>`; each declared role
    /// resolves to `<subject>/<role>`. Every resolved directory is created
    /// when absent, so role paths are guaranteed to exist (even if empty)
    /// before `implement` runs.
    pub fn resolve(
        subject_dir: &Path,
        name: &str,
        roles: &[&str],
        config: &PipelineConfig,
        lookup: Arc<dyn ImageLookup>,
    ) -> Result<Self, RunnerError> {
        Self::resolve_with(subject_dir, name, roles, config, lookup, true)
    }

    /// Resolves the same roles without touching the filesystem, for
    /// read-only inspection of an existing tree.
    pub fn locate(
        subject_dir: &Path,
        name: &str,
        roles: &[&str],
        config: &PipelineConfig,
        lookup: Arc<dyn ImageLookup>,
    ) -> Result<Self, RunnerError> {
        Self::resolve_with(subject_dir, name, roles, config, lookup, false)
    }

    fn resolve_with(
        subject_dir: &Path,
        name: &str,
        roles: &[&str],
        config: &PipelineConfig,
        lookup: Arc<dyn ImageLookup>,
        create: bool,
    ) -> Result<Self, RunnerError> {
        let working_dir = subject_dir.join(name);
        if create {
            std::fs::create_dir_all(&working_dir)?;
        }

        let mut resolved = BTreeMap::new();
        for role in roles {
            let dir = subject_dir.join(role);
            if create {
                std::fs::create_dir_all(&dir)?;
            }
            resolved.insert((*role).to_string(), dir);
        }

        Ok(Self {
            name: name.to_string(),
            working_dir,
            roles: resolved,
            settings: config.task(name),
            general: config.general.clone(),
            lookup,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// The resolved path of a declared role.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::UnresolvedRole` when the stage did not declare
    /// `role` at construction.
    pub fn role(&self, role: &str) -> Result<&Path, TaskError> {
        self.roles
            .get(role)
            .map(PathBuf::as_path)
            .ok_or_else(|| TaskError::UnresolvedRole(role.to_string()))
    }

    /// This stage's configuration view.
    pub fn settings(&self) -> &TaskSettings {
        &self.settings
    }

    /// The global configuration snapshot.
    pub fn general(&self) -> &GeneralSettings {
        &self.general
    }

    /// Looks up an artifact by tags with the default imaging extension.
    pub fn image(&self, dir: &Path, tags: &[&str]) -> Option<PathBuf> {
        self.lookup.find(dir, tags, None)
    }

    /// Looks up an artifact by tags with an explicit extension.
    pub fn image_with_ext(&self, dir: &Path, tags: &[&str], ext: &str) -> Option<PathBuf> {
        self.lookup.find(dir, tags, Some(ext))
    }

    /// Builds a canonical derived name rooted in this stage's working
    /// directory, regardless of where the base artifact lives.
    pub fn target(&self, base: &Path, tags: &[&str], ext: Option<&str>) -> PathBuf {
        let named = build_name(base, tags, ext);
        match named.file_name() {
            Some(file_name) => self.working_dir.join(file_name),
            None => self.working_dir.clone(),
        }
    }
}

/// One pipeline stage.
///
/// The runner evaluates the lifecycle strictly in order: `is_ignore`,
/// `meet_requirement`, `is_dirty`, `implement`, `qa_supplier`. The three
/// predicates never fail — absence of data is state, not an error — and
/// only `implement` may return an error, which halts the subject's
/// remaining stages.
#[async_trait]
pub trait Task: Send + Sync {
    /// Stage name; also the working directory name under the subject.
    fn name(&self) -> &str;

    /// True when the stage is switched off by configuration (the "none"
    /// algorithm sentinel or an explicit ignore flag). An ignored stage
    /// has no side effects and no QA entry.
    fn is_ignore(&self) -> bool {
        false
    }

    /// True when the stage's upstream inputs are available. A stage with
    /// no requirement check always reports true.
    fn meet_requirement(&self) -> bool {
        true
    }

    /// The stage's own outputs. When all are present the stage is
    /// already done and `implement` is skipped; QA is still collected.
    fn is_dirty(&self) -> Images;

    /// Performs the transformation, writing canonical outputs as the
    /// final step so readers only ever observe fully written artifacts.
    async fn implement(&mut self) -> Result<(), TaskError>;

    /// QA artifacts and the free-text status message for reporting.
    fn qa_supplier(&self) -> Images {
        Images::new()
    }
}
