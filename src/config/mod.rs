//! Pipeline configuration.
//!
//! Configuration is a layered, string-keyed snapshot: a global YAML file
//! provides server-wide settings (external-tool availability, thread
//! hints) and per-stage defaults; an optional per-subject file overrides
//! individual keys. The merged result is immutable for the duration of a
//! subject's run — stages receive their view at construction and nothing
//! reads global state during `implement`.
//!
//! Algorithm names are validated at load time against the closed set of
//! known variants; an unknown name is a configuration error, not a
//! silent fallthrough at execution time.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::dispatch::Algorithm;
use crate::error::ConfigError;

/// Server-wide settings shared by every stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Whether the external scriptable tool (matlab) is installed on this
    /// server. When false, external-tool algorithm variants degrade to a
    /// warning instead of failing the pipeline.
    pub matlab_available: bool,
    /// Thread-count hint passed to external tools.
    pub nb_threads: usize,
    /// Default for per-stage `cleanup` when a stage does not set it.
    pub cleanup: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            matlab_available: false,
            nb_threads: 1,
            cleanup: false,
        }
    }
}

/// Per-stage settings, keyed by stage name in the `tasks` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    /// Algorithm variant for this stage; `None` behaves as the "none"
    /// sentinel (stage ignored).
    pub algorithm: Option<String>,
    /// Explicit ignore override, independent of the algorithm.
    pub ignore: bool,
    /// Delete decompressed intermediates after the external-tool path.
    /// Falls back to [`GeneralSettings::cleanup`] when unset.
    pub cleanup: Option<bool>,
    /// Base name for generated external-tool scripts.
    pub script_name: String,
    /// Coil count for the noise-model sigma estimation.
    pub number_array_coil: u32,
    /// Regularization weight forwarded to external denoising scripts.
    pub beta: f64,
    /// Apply rician correction in external denoising scripts.
    pub rician: bool,
    /// External-tool invocation timeout, in seconds.
    pub timeout_secs: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            algorithm: None,
            ignore: false,
            cleanup: None,
            script_name: "script".to_string(),
            number_array_coil: 1,
            beta: 1.0,
            rician: true,
            timeout_secs: 10800,
        }
    }
}

impl TaskSettings {
    /// The configured algorithm name, with absence reading as "none".
    pub fn algorithm_name(&self) -> &str {
        self.algorithm.as_deref().unwrap_or("none")
    }

    /// Effective cleanup flag after applying the global default.
    pub fn effective_cleanup(&self, general: &GeneralSettings) -> bool {
        self.cleanup.unwrap_or(general.cleanup)
    }

    /// External-tool timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Immutable configuration snapshot for one subject run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub general: GeneralSettings,
    pub tasks: BTreeMap<String, TaskSettings>,
}

impl PipelineConfig {
    /// Loads the global configuration file, overlaying `subject` onto it
    /// key by key when provided, and validates the result.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a file is missing or unparseable, or
    /// when a stage names an unknown algorithm.
    pub fn load(global: &Path, subject: Option<&Path>) -> Result<Self, ConfigError> {
        let mut value = read_yaml(global)?;
        if let Some(subject) = subject {
            let overlay = read_yaml(subject)?;
            value = merge_values(value, overlay);
        }

        let config: PipelineConfig = serde_yaml::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a configuration from a YAML string (single layer).
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Settings for `name`, falling back to defaults for undeclared
    /// stages.
    pub fn task(&self, name: &str) -> TaskSettings {
        self.tasks.get(name).cloned().unwrap_or_default()
    }

    /// Rejects stages whose algorithm name is outside the closed variant
    /// set.
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, settings) in &self.tasks {
            if let Some(ref algorithm) = settings.algorithm {
                if Algorithm::parse(algorithm).is_none() {
                    return Err(ConfigError::UnknownAlgorithm {
                        task: name.clone(),
                        value: algorithm.clone(),
                    });
                }
            }
            if settings.timeout_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("tasks.{name}.timeout_secs"),
                    message: "timeout must be positive".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }
    let source = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&source)?)
}

/// Deep-merges two YAML values: mappings merge recursively with `overlay`
/// winning per key, everything else is replaced wholesale.
fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const GLOBAL: &str = r#"
general:
  matlab_available: true
  nb_threads: 4
tasks:
  denoising:
    algorithm: lpca
    beta: 0.7
"#;

    #[test]
    fn test_from_yaml_defaults() {
        let config = PipelineConfig::from_yaml("{}").unwrap();
        assert!(!config.general.matlab_available);
        assert_eq!(config.general.nb_threads, 1);

        let settings = config.task("denoising");
        assert_eq!(settings.algorithm_name(), "none");
        assert_eq!(settings.timeout(), Duration::from_secs(10800));
    }

    #[test]
    fn test_unknown_algorithm_rejected_at_load() {
        let err = PipelineConfig::from_yaml(
            "tasks:\n  denoising:\n    algorithm: wavelets\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownAlgorithm { .. }));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = PipelineConfig::from_yaml(
            "tasks:\n  denoising:\n    timeout_secs: 0\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_subject_overlay_wins_per_key() {
        let tmp = TempDir::new().unwrap();
        let global = tmp.path().join("global.yaml");
        let subject = tmp.path().join("subject.yaml");
        fs::write(&global, GLOBAL).unwrap();
        fs::write(
            &subject,
            "tasks:\n  denoising:\n    algorithm: nlmeans\n",
        )
        .unwrap();

        let config = PipelineConfig::load(&global, Some(&subject)).unwrap();
        let settings = config.task("denoising");

        // Subject override applies; untouched keys survive from global.
        assert_eq!(settings.algorithm_name(), "nlmeans");
        assert!((settings.beta - 0.7).abs() < f64::EPSILON);
        assert!(config.general.matlab_available);
    }

    #[test]
    fn test_missing_file_reported() {
        let tmp = TempDir::new().unwrap();
        let err =
            PipelineConfig::load(&tmp.path().join("absent.yaml"), None).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_effective_cleanup_fallback() {
        let config = PipelineConfig::from_yaml("general:\n  cleanup: true\n").unwrap();
        let settings = config.task("denoising");
        assert!(settings.effective_cleanup(&config.general));

        let config =
            PipelineConfig::from_yaml("tasks:\n  denoising:\n    cleanup: false\n")
                .unwrap();
        let settings = config.task("denoising");
        assert!(!settings.effective_cleanup(&config.general));
    }
}
