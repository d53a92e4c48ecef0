//! External algorithm dispatch.
//!
//! A stage may offer several named algorithm variants. The closed
//! [`Algorithm`] enum is resolved once from configuration at stage
//! construction: "none" short-circuits the whole stage, the in-process
//! variant computes directly on loaded array data, and the external-tool
//! variants render a parameterized script from a template and hand it to a
//! [`ScriptInvoker`] with a bounded timeout.
//!
//! The invoker is a seam: the orchestration core only depends on its
//! success / failure / timeout outcomes, never on how the process is
//! launched or its output interpreted.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tera::{Context, Tera};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::DispatchError;

pub mod gzip;

pub use gzip::{gunzip_file, gzip_file};

/// Script template backing an external-tool variant. Both share one
/// external tool; only the rendered script differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptTemplate {
    /// Adaptive optimized non-local means.
    Aonlm,
    /// Local PCA.
    Lpca,
}

impl ScriptTemplate {
    /// The embedded template source.
    pub fn source(&self) -> &'static str {
        match self {
            ScriptTemplate::Aonlm => include_str!("../../templates/denoise_aonlm.tpl"),
            ScriptTemplate::Lpca => include_str!("../../templates/denoise_lpca.tpl"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScriptTemplate::Aonlm => "aonlm",
            ScriptTemplate::Lpca => "lpca",
        }
    }
}

/// Algorithm variant for a stage, resolved once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Sentinel: the stage is ignored outright.
    None,
    /// In-process non-local means on loaded array data.
    Nlmeans,
    /// Templated script run through the external tool.
    External(ScriptTemplate),
}

impl Algorithm {
    /// Parses a configured algorithm name. Matching is case-insensitive;
    /// unknown names yield `None` and are rejected at configuration load,
    /// never at execution time.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(Algorithm::None),
            "nlmeans" => Some(Algorithm::Nlmeans),
            "aonlm" => Some(Algorithm::External(ScriptTemplate::Aonlm)),
            "lpca" => Some(Algorithm::External(ScriptTemplate::Lpca)),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Algorithm::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::None => "none",
            Algorithm::Nlmeans => "nlmeans",
            Algorithm::External(template) => template.name(),
        }
    }
}

/// Parameters substituted into an external-tool script template.
#[derive(Debug, Clone)]
pub struct ScriptParams {
    pub source: PathBuf,
    pub target: PathBuf,
    pub working_dir: PathBuf,
    pub beta: f64,
    pub rician: bool,
    pub nb_threads: usize,
}

/// Renders a script template with the given parameters.
pub fn render_script(
    template: ScriptTemplate,
    params: &ScriptParams,
) -> Result<String, DispatchError> {
    let mut context = Context::new();
    context.insert("source", &params.source.display().to_string());
    context.insert("target", &params.target.display().to_string());
    context.insert("working_dir", &params.working_dir.display().to_string());
    context.insert("beta", &params.beta);
    context.insert("rician", &u8::from(params.rician));
    context.insert("nb_threads", &params.nb_threads);

    Ok(Tera::one_off(template.source(), &context, false)?)
}

/// Outcome of a completed external invocation.
#[derive(Debug)]
pub struct ExitInfo {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExitInfo {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Seam for running a generated script through the external tool.
#[async_trait]
pub trait ScriptInvoker: Send + Sync {
    /// Runs `script`, optionally appending one extra argument pair, and
    /// waits for completion within `timeout`.
    ///
    /// # Errors
    ///
    /// Timeouts and spawn failures are hard errors; a completed process
    /// with a non-zero exit code is reported through [`ExitInfo`] and
    /// interpreted by the caller.
    async fn invoke(
        &self,
        script: &Path,
        extra_args: Option<(&str, &str)>,
        timeout: Duration,
    ) -> Result<ExitInfo, DispatchError>;
}

/// Production invoker launching matlab in batch mode.
pub struct MatlabInvoker {
    command: String,
}

impl MatlabInvoker {
    pub fn new() -> Self {
        Self {
            command: "matlab".to_string(),
        }
    }

    /// Uses a custom executable path.
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for MatlabInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScriptInvoker for MatlabInvoker {
    async fn invoke(
        &self,
        script: &Path,
        extra_args: Option<(&str, &str)>,
        timeout: Duration,
    ) -> Result<ExitInfo, DispatchError> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.command);
        cmd.arg("-nodisplay")
            .arg("-nosplash")
            .arg("-nodesktop")
            .arg("-r")
            .arg(format!("run('{}')", script.display()))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(parent) = script.parent() {
            cmd.current_dir(parent);
        }
        if let Some((key, value)) = extra_args {
            cmd.arg(key).arg(value);
        }

        info!("Launching {} on {}", self.command, script.display());

        let mut child = cmd.spawn().map_err(|e| DispatchError::SpawnFailed {
            command: self.command.clone(),
            message: e.to_string(),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut stdout_lines = stdout.map(|s| BufReader::new(s).lines());
        let mut stderr_lines = stderr.map(|s| BufReader::new(s).lines());

        let mut stdout_content = String::new();
        let mut stderr_content = String::new();

        let waited = tokio::time::timeout(timeout, async {
            loop {
                tokio::select! {
                    line = next_line(&mut stdout_lines) => {
                        match line {
                            Some(l) => {
                                debug!("[{} stdout] {}", self.command, l);
                                stdout_content.push_str(&l);
                                stdout_content.push('\n');
                            }
                            None => break,
                        }
                    }
                    line = next_line(&mut stderr_lines) => {
                        if let Some(l) = line {
                            debug!("[{} stderr] {}", self.command, l);
                            stderr_content.push_str(&l);
                            stderr_content.push('\n');
                        }
                    }
                }
            }

            child.wait().await
        })
        .await;

        let exit_status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(DispatchError::Io(e)),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed-out {}: {}", self.command, e);
                }
                return Err(DispatchError::Timeout(timeout));
            }
        };

        let duration = start.elapsed();
        let exit_code = exit_status.code().unwrap_or(-1);

        info!(
            "{} completed in {:?} with exit code {}",
            self.command, duration, exit_code
        );

        Ok(ExitInfo {
            exit_code,
            stdout: stdout_content,
            stderr: stderr_content,
            duration,
        })
    }
}

type Lines<R> = tokio::io::Lines<BufReader<R>>;

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines {
        Some(lines) => match lines.next_line().await {
            Ok(line) => line,
            Err(e) => {
                warn!("Error reading tool output: {}", e);
                None
            }
        },
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_parse_known_variants() {
        assert_eq!(Algorithm::parse("none"), Some(Algorithm::None));
        assert_eq!(Algorithm::parse("NLMEANS"), Some(Algorithm::Nlmeans));
        assert_eq!(
            Algorithm::parse("aonlm"),
            Some(Algorithm::External(ScriptTemplate::Aonlm))
        );
        assert_eq!(
            Algorithm::parse("lpca"),
            Some(Algorithm::External(ScriptTemplate::Lpca))
        );
    }

    #[test]
    fn test_algorithm_parse_unknown_is_rejected() {
        assert_eq!(Algorithm::parse("wavelets"), None);
        assert_eq!(Algorithm::parse(""), None);
    }

    #[test]
    fn test_render_script_substitutes_parameters() {
        let params = ScriptParams {
            source: PathBuf::from("/work/dwi_tmp.nii"),
            target: PathBuf::from("/work/dwi_denoise_tmp.nii"),
            working_dir: PathBuf::from("/work"),
            beta: 0.75,
            rician: true,
            nb_threads: 8,
        };

        let script = render_script(ScriptTemplate::Lpca, &params).unwrap();
        assert!(script.contains("DWIDenoisingLPCA"));
        assert!(script.contains("/work/dwi_tmp.nii"));
        assert!(script.contains("0.75"));
        assert!(script.contains("maxNumCompThreads(8)"));

        let script = render_script(ScriptTemplate::Aonlm, &params).unwrap();
        assert!(script.contains("DWIDenoisingAONLM"));
    }

    #[test]
    fn test_rician_rendered_as_numeric_flag() {
        let params = ScriptParams {
            source: PathBuf::from("s.nii"),
            target: PathBuf::from("t.nii"),
            working_dir: PathBuf::from("."),
            beta: 1.0,
            rician: false,
            nb_threads: 1,
        };
        let script = render_script(ScriptTemplate::Lpca, &params).unwrap();
        assert!(script.contains(", 0, 1);"));
    }

    #[tokio::test]
    async fn test_invoker_timeout_is_a_hard_failure() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let tool = tmp.path().join("slow-tool.sh");
        std::fs::write(&tool, "#!/bin/sh\nsleep 5\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let invoker = MatlabInvoker::with_command(tool.display().to_string());
        let err = invoker
            .invoke(&tmp.path().join("script.m"), None, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_invoker_spawn_failure_is_reported() {
        let invoker = MatlabInvoker::with_command("/nonexistent/matlab-binary");
        let err = invoker
            .invoke(Path::new("/tmp/none.m"), None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::SpawnFailed { .. }));
    }
}
