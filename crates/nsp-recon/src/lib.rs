//! FreeSurfer `recon-all` execution: Docker or native, with a hard
//! wall-clock timeout and sentinel-based completion detection.
//!
//! The tool's exit code alone is not trusted: `recon-all` can exit zero
//! after only part of its multi-hour workload, and a prior run may leave
//! stale output behind. An invocation counts as completed only when the
//! process exits zero AND the completion sentinel exists in the subject's
//! output tree afterwards. Both invocation modes produce the same output
//! layout, so the sentinel check is mode-independent.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, info_span};

use nsp_core::ProcessingStatus;

pub const CRATE_NAME: &str = "nsp-recon";

/// Relative path of the completion sentinel inside a subject's output
/// directory. Treated as a stable external contract with FreeSurfer.
pub const RECON_DONE_SENTINEL: &str = "scripts/recon-all.done";

/// Characters of stdout/stderr retained for diagnostics.
const OUTPUT_TAIL_CHARS: usize = 1000;

/// Default wall-clock limit for one run (10 hours).
pub const DEFAULT_RECON_TIMEOUT: Duration = Duration::from_secs(36_000);

#[derive(Debug, Error)]
pub enum ReconError {
    #[error("launching {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// How the external tool is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconMode {
    /// `docker run` with the input directory mounted read-only, the
    /// subjects directory mounted read-write, and the two environment
    /// bindings set inside the container.
    Docker { image: String },
    /// Direct invocation of a local FreeSurfer installation, with the
    /// same two environment bindings set on the child process.
    Native,
}

#[derive(Debug, Clone)]
pub struct ReconConfig {
    pub freesurfer_home: PathBuf,
    pub subjects_dir: PathBuf,
    pub mode: ReconMode,
    pub timeout: Duration,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            freesurfer_home: PathBuf::from("/opt/freesurfer"),
            subjects_dir: PathBuf::from("/data/freesurfer/subjects"),
            mode: ReconMode::Docker {
                image: "freesurfer/freesurfer:latest".to_string(),
            },
            timeout: DEFAULT_RECON_TIMEOUT,
        }
    }
}

/// Normalized outcome of one `recon-all` invocation. `runtime_seconds`
/// is wall-clock from spawn to exit (or timeout) regardless of status;
/// `output_dir` is only asserted for non-timeout outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconOutcome {
    pub status: ProcessingStatus,
    pub runtime_seconds: f64,
    pub output_dir: Option<PathBuf>,
    pub stdout_tail: Option<String>,
    pub stderr_tail: Option<String>,
}

fn tail(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let skip = text.chars().count().saturating_sub(OUTPUT_TAIL_CHARS);
    Some(text.chars().skip(skip).collect())
}

#[derive(Debug, Clone)]
pub struct ReconRunner {
    config: ReconConfig,
}

impl ReconRunner {
    pub fn new(config: ReconConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    fn docker_command(&self, nifti_file: &Path, subject_id: &str) -> Command {
        // Relative input paths would be resolved against the daemon's
        // context, not ours.
        let nifti_file = std::fs::canonicalize(nifti_file)
            .unwrap_or_else(|_| nifti_file.to_path_buf());
        let nifti_dir = nifti_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let nifti_name = nifti_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let image = match &self.config.mode {
            ReconMode::Docker { image } => image.clone(),
            ReconMode::Native => unreachable!("docker_command only built in docker mode"),
        };

        let mut cmd = Command::new("docker");
        cmd.args(["run", "--rm"])
            .arg("-v")
            .arg(format!("{}:/input:ro", nifti_dir.display()))
            .arg("-v")
            .arg(format!("{}:/output", self.config.subjects_dir.display()))
            .args(["-e", "SUBJECTS_DIR=/output"])
            .arg("-e")
            .arg(format!(
                "FREESURFER_HOME={}",
                self.config.freesurfer_home.display()
            ))
            .arg(image)
            .arg("recon-all")
            .arg("-i")
            .arg(format!("/input/{nifti_name}"))
            .arg("-s")
            .arg(subject_id)
            .arg("-all");
        cmd
    }

    fn native_command(&self, nifti_file: &Path, subject_id: &str) -> Command {
        let mut cmd = Command::new(self.config.freesurfer_home.join("bin").join("recon-all"));
        cmd.arg("-i")
            .arg(nifti_file)
            .arg("-s")
            .arg(subject_id)
            .arg("-all")
            .env("FREESURFER_HOME", &self.config.freesurfer_home)
            .env("SUBJECTS_DIR", &self.config.subjects_dir);
        cmd
    }

    /// Run `recon-all` for one subject and classify the outcome.
    ///
    /// Tool failure and timeout are reported through the outcome's
    /// status, not as errors; `Err` is reserved for not being able to
    /// launch the process at all.
    pub async fn run_recon_all(
        &self,
        nifti_file: &Path,
        subject_id: &str,
    ) -> Result<ReconOutcome, ReconError> {
        let span = info_span!("recon_all", subject_id);
        let _guard = span.enter();

        let (mut cmd, tool) = match &self.config.mode {
            ReconMode::Docker { .. } => (self.docker_command(nifti_file, subject_id), "docker"),
            ReconMode::Native => (self.native_command(nifti_file, subject_id), "recon-all"),
        };
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(mode = ?self.config.mode, "running FreeSurfer recon-all");
        let start = Instant::now();
        let child = cmd.spawn().map_err(|source| ReconError::Spawn {
            tool: tool.to_string(),
            source,
        })?;

        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ReconError::Spawn {
                    tool: tool.to_string(),
                    source,
                })
            }
            Err(_) => {
                // Dropping the wait future kills the child (kill_on_drop).
                let runtime = start.elapsed().as_secs_f64();
                error!(runtime_seconds = runtime, "recon-all timed out");
                return Ok(ReconOutcome {
                    status: ProcessingStatus::Timeout,
                    runtime_seconds: runtime,
                    output_dir: None,
                    stdout_tail: None,
                    stderr_tail: Some(format!(
                        "process timed out after {}s",
                        self.config.timeout.as_secs()
                    )),
                });
            }
        };

        let runtime = start.elapsed().as_secs_f64();
        let stdout_tail = tail(&String::from_utf8_lossy(&output.stdout));
        let stderr_tail = tail(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            error!(code = ?output.status.code(), "recon-all failed");
            return Ok(ReconOutcome {
                status: ProcessingStatus::Failed,
                runtime_seconds: runtime,
                output_dir: None,
                stdout_tail,
                stderr_tail,
            });
        }

        let output_dir = self.config.subjects_dir.join(subject_id);
        let status = if output_dir.join(RECON_DONE_SENTINEL).exists() {
            ProcessingStatus::Completed
        } else {
            // Exit zero without the sentinel means a partial run.
            ProcessingStatus::Failed
        };

        info!(status = %status, runtime_seconds = runtime, "recon-all finished");
        Ok(ReconOutcome {
            status,
            runtime_seconds: runtime,
            output_dir: Some(output_dir),
            stdout_tail,
            stderr_tail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    /// Install a scripted `recon-all` stand-in under a temp FreeSurfer
    /// home and return a runner in native mode against it.
    fn runner_with_script(
        home: &Path,
        subjects_dir: &Path,
        script_body: &str,
        timeout: Duration,
    ) -> ReconRunner {
        let bin_dir = home.join("bin");
        std::fs::create_dir_all(&bin_dir).expect("create bin dir");
        let script = bin_dir.join("recon-all");
        std::fs::write(&script, script_body).expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        std::fs::create_dir_all(subjects_dir).expect("create subjects dir");

        ReconRunner::new(ReconConfig {
            freesurfer_home: home.to_path_buf(),
            subjects_dir: subjects_dir.to_path_buf(),
            mode: ReconMode::Native,
            timeout,
        })
    }

    #[tokio::test]
    async fn sentinel_plus_exit_zero_is_completed() {
        let dir = tempdir().expect("tempdir");
        let home = dir.path().join("freesurfer");
        let subjects = dir.path().join("subjects");
        // recon-all -i <file> -s <subject> -all
        let runner = runner_with_script(
            &home,
            &subjects,
            "#!/bin/sh\nmkdir -p \"$SUBJECTS_DIR/$4/scripts\"\ntouch \"$SUBJECTS_DIR/$4/scripts/recon-all.done\"\necho finished\n",
            Duration::from_secs(10),
        );

        let outcome = runner
            .run_recon_all(Path::new("/tmp/sub-001_T1w.nii.gz"), "sub-001")
            .await
            .expect("run");
        assert_eq!(outcome.status, ProcessingStatus::Completed);
        assert_eq!(outcome.output_dir, Some(subjects.join("sub-001")));
        assert!(outcome.stdout_tail.as_deref().unwrap().contains("finished"));
        assert!(outcome.runtime_seconds >= 0.0);
    }

    #[tokio::test]
    async fn exit_zero_without_sentinel_is_failed() {
        let dir = tempdir().expect("tempdir");
        let runner = runner_with_script(
            &dir.path().join("freesurfer"),
            &dir.path().join("subjects"),
            "#!/bin/sh\nexit 0\n",
            Duration::from_secs(10),
        );

        let outcome = runner
            .run_recon_all(Path::new("/tmp/sub-002_T1w.nii.gz"), "sub-002")
            .await
            .expect("run");
        assert_eq!(outcome.status, ProcessingStatus::Failed);
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed_with_stderr_tail() {
        let dir = tempdir().expect("tempdir");
        let runner = runner_with_script(
            &dir.path().join("freesurfer"),
            &dir.path().join("subjects"),
            "#!/bin/sh\necho 'talairach registration failed' >&2\nexit 1\n",
            Duration::from_secs(10),
        );

        let outcome = runner
            .run_recon_all(Path::new("/tmp/sub-003_T1w.nii.gz"), "sub-003")
            .await
            .expect("run");
        assert_eq!(outcome.status, ProcessingStatus::Failed);
        assert_eq!(outcome.output_dir, None);
        assert!(outcome
            .stderr_tail
            .as_deref()
            .unwrap()
            .contains("talairach registration failed"));
    }

    #[tokio::test]
    async fn exceeding_the_timeout_is_timeout_with_no_output_dir() {
        let dir = tempdir().expect("tempdir");
        let runner = runner_with_script(
            &dir.path().join("freesurfer"),
            &dir.path().join("subjects"),
            "#!/bin/sh\nsleep 30\n",
            Duration::from_millis(200),
        );

        let outcome = runner
            .run_recon_all(Path::new("/tmp/sub-004_T1w.nii.gz"), "sub-004")
            .await
            .expect("run");
        assert_eq!(outcome.status, ProcessingStatus::Timeout);
        assert_eq!(outcome.output_dir, None);
        assert!(outcome.runtime_seconds >= 0.2);
        assert!(outcome
            .stderr_tail
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn unlaunchable_tool_is_a_spawn_error() {
        let dir = tempdir().expect("tempdir");
        let runner = ReconRunner::new(ReconConfig {
            freesurfer_home: dir.path().join("nowhere"),
            subjects_dir: dir.path().join("subjects"),
            mode: ReconMode::Native,
            timeout: Duration::from_secs(1),
        });

        let err = runner
            .run_recon_all(Path::new("/tmp/sub-005_T1w.nii.gz"), "sub-005")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconError::Spawn { .. }));
    }

    #[test]
    fn tails_are_bounded_and_keep_the_end() {
        let long = "x".repeat(2500) + "THE-END";
        let tail = tail(&long).unwrap();
        assert_eq!(tail.chars().count(), 1000);
        assert!(tail.ends_with("THE-END"));
        assert_eq!(super::tail(""), None);
    }

    #[test]
    fn docker_command_mounts_and_env_bindings() {
        let runner = ReconRunner::new(ReconConfig {
            freesurfer_home: PathBuf::from("/opt/freesurfer"),
            subjects_dir: PathBuf::from("/data/subjects"),
            mode: ReconMode::Docker {
                image: "freesurfer/freesurfer:7.4.1".to_string(),
            },
            timeout: DEFAULT_RECON_TIMEOUT,
        });

        let cmd = runner.docker_command(Path::new("/scans/sub-001_T1w.nii.gz"), "sub-001");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"/scans:/input:ro".to_string()));
        assert!(args.contains(&"/data/subjects:/output".to_string()));
        assert!(args.contains(&"SUBJECTS_DIR=/output".to_string()));
        assert!(args.contains(&"FREESURFER_HOME=/opt/freesurfer".to_string()));
        assert!(args.contains(&"/input/sub-001_T1w.nii.gz".to_string()));
        assert!(args.contains(&"-all".to_string()));
    }
}
