//! External media tool invocation.
//!
//! Tools are run as an argument vector. Transformation success is judged by
//! the expected artifact existing once the process has exited; the exit code
//! is logged but not trusted. Probes read a single number from stdout.
//!
//! An expected artifact is removed before the tool starts, so only a file
//! written by this invocation can count as its output.

use crate::config::ToolsConfig;
use crate::error::ToolError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// What an invocation has to leave behind to count as a success
#[derive(Debug, Clone, PartialEq)]
pub enum Expectation {
    /// A file at this path must exist after the process exits
    Artifact(PathBuf),
    /// The first line of stdout must parse as a number
    ScalarStdout,
}

/// One external tool invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub expect: Expectation,
    /// Absolute cutoff for this call, queue time included
    pub deadline: Option<Instant>,
    /// Least time that must remain once a slot is free for the tool to start
    pub min_budget: Duration,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>, expect: Expectation) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            expect,
            deadline: None,
            min_budget: Duration::ZERO,
        }
    }

    /// Append a single argument.
    pub fn arg(mut self, s: impl Into<String>) -> Self {
        self.args.push(s.into());
        self
    }

    /// Append an argument taken from a path.
    pub fn path_arg(self, path: &Path) -> Self {
        let arg = path.to_string_lossy().into_owned();
        self.arg(arg)
    }

    pub fn with_deadline(mut self, deadline: Instant, min_budget: Duration) -> Self {
        self.deadline = Some(deadline);
        self.min_budget = min_budget;
        self
    }

    /// Short program name for logs and errors
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Command line for diagnostics
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What a successful invocation produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub artifact: Option<PathBuf>,
    pub metric: Option<f64>,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

/// Runs external media tools
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn invoke(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError>;
}

/// Runs tools as child processes, bounded by a process-wide semaphore
pub struct ProcessToolRunner {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl ProcessToolRunner {
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_invocations.max(1))),
            timeout: config.timeout(),
        }
    }
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    #[instrument(skip(self, invocation), fields(tool = %invocation.tool_name()))]
    async fn invoke(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        let tool = invocation.tool_name();

        // Acquire semaphore permit to limit concurrent tool processes
        let acquire = self.permits.acquire();
        let permit = match invocation.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, acquire)
                .await
                .map_err(|_| ToolError::DeadlineExceeded {
                    tool: tool.clone(),
                    remaining: Duration::ZERO,
                })?,
            None => acquire.await,
        };
        let _permit = permit.map_err(|e| ToolError::Spawn {
            tool: tool.clone(),
            message: e.to_string(),
        })?;

        // Time spent queued counts against the caller's deadline
        let limit = Instant::now() + self.timeout;
        let until = match invocation.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() || remaining < invocation.min_budget {
                    return Err(ToolError::DeadlineExceeded { tool, remaining });
                }
                deadline.min(limit)
            }
            None => limit,
        };

        if let Expectation::Artifact(path) = &invocation.expect {
            clear_stale_artifact(&tool, path).await?;
        }

        debug!(command = %invocation.display(), "Invoking tool");
        metrics::counter!("postprod.tool.invocations", "tool" => tool.clone()).increment(1);

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Spawn {
                tool: tool.clone(),
                message: e.to_string(),
            })?;

        let timeout = until.saturating_duration_since(Instant::now());
        let output = match tokio::time::timeout_at(until, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::Spawn {
                    tool,
                    message: format!("I/O error waiting for process: {}", e),
                })
            }
            Err(_elapsed) => return Err(ToolError::Timeout { tool, timeout }),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        // ffmpeg writes its diagnostics to stderr
        debug!(exit_code = ?exit_code, stderr = %stderr.trim(), "Tool finished");

        judge(&tool, &invocation.expect, exit_code, &stdout, stderr).await
    }
}

/// Remove a leftover artifact so a failed run cannot pass for a fresh one
async fn clear_stale_artifact(tool: &str, path: &Path) -> Result<(), ToolError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(artifact = %path.display(), "Removed stale artifact");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ToolError::Spawn {
            tool: tool.to_string(),
            message: format!("cannot clear previous output {}: {}", path.display(), e),
        }),
    }
}

/// Decide success from what the process left behind
async fn judge(
    tool: &str,
    expect: &Expectation,
    exit_code: Option<i32>,
    stdout: &str,
    stderr: String,
) -> Result<ToolOutput, ToolError> {
    match expect {
        Expectation::Artifact(path) => {
            let exists = tokio::fs::try_exists(path).await.unwrap_or(false);
            if !exists {
                return Err(ToolError::NoArtifact {
                    tool: tool.to_string(),
                    expected: path.clone(),
                    exit_code,
                });
            }
            if exit_code != Some(0) {
                warn!(
                    tool = %tool,
                    exit_code = ?exit_code,
                    artifact = %path.display(),
                    "Tool reported failure but produced its artifact"
                );
            }
            Ok(ToolOutput {
                artifact: Some(path.clone()),
                metric: None,
                exit_code,
                stderr,
            })
        }
        Expectation::ScalarStdout => {
            let metric = parse_scalar(stdout).ok_or_else(|| ToolError::Unparseable {
                tool: tool.to_string(),
                output: stdout.trim().to_string(),
            })?;
            Ok(ToolOutput {
                artifact: None,
                metric: Some(metric),
                exit_code,
                stderr,
            })
        }
    }
}

/// Parse the first non-empty line of tool output as a number
fn parse_scalar(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

/// Argument vectors for the media tools the pipelines use
pub mod commands {
    use super::{Expectation, ToolInvocation};
    use std::path::{Path, PathBuf};

    /// Duration of a media file in seconds, printed as a bare number
    pub fn probe_duration(ffprobe: &Path, input: &Path) -> ToolInvocation {
        ToolInvocation::new(ffprobe, Expectation::ScalarStdout)
            .arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("compact=print_section=0:nokey=1:escape=csv")
            .arg("-show_entries")
            .arg("format=duration")
            .path_arg(input)
    }

    /// First `preview_secs` of the input with a fade-out over the last `fade_secs`
    pub fn fade_out(
        ffmpeg: &Path,
        input: &Path,
        output: &Path,
        preview_secs: u32,
        fade_secs: u32,
    ) -> ToolInvocation {
        let fade_start = preview_secs.saturating_sub(fade_secs);
        ToolInvocation::new(ffmpeg, Expectation::Artifact(output.to_path_buf()))
            .arg("-y")
            .arg("-i")
            .path_arg(input)
            .arg("-af")
            .arg(format!("afade=t=out:st={}:d={}", fade_start, fade_secs))
            .arg("-to")
            .arg(preview_secs.to_string())
            .path_arg(output)
    }

    /// Where a converted image is written: the source path plus `.tga`
    pub fn converted_image_path(input: &Path) -> PathBuf {
        let mut name = input.as_os_str().to_owned();
        name.push(".tga");
        PathBuf::from(name)
    }

    /// Convert an image to TGA next to its source
    pub fn convert_image(ffmpeg: &Path, input: &Path) -> ToolInvocation {
        let output = converted_image_path(input);
        ToolInvocation::new(ffmpeg, Expectation::Artifact(output.clone()))
            .arg("-y")
            .arg("-i")
            .path_arg(input)
            .path_arg(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::commands;
    use super::*;

    #[test]
    fn test_probe_duration_arguments() {
        let invocation =
            commands::probe_duration(Path::new("./bin/ffprobe"), Path::new("/tmp/a.mp3"));
        assert_eq!(invocation.expect, Expectation::ScalarStdout);
        assert_eq!(
            invocation.display(),
            "./bin/ffprobe -v quiet -print_format compact=print_section=0:nokey=1:escape=csv \
             -show_entries format=duration /tmp/a.mp3"
        );
    }

    #[test]
    fn test_fade_out_arguments() {
        let invocation = commands::fade_out(
            Path::new("./bin/ffmpeg"),
            Path::new("/tmp/audio/full/doc/gen.mp3"),
            Path::new("/tmp/audio/preview/doc/gen.wav"),
            30,
            3,
        );
        assert_eq!(
            invocation.args,
            vec![
                "-y",
                "-i",
                "/tmp/audio/full/doc/gen.mp3",
                "-af",
                "afade=t=out:st=27:d=3",
                "-to",
                "30",
                "/tmp/audio/preview/doc/gen.wav",
            ]
        );
        assert_eq!(
            invocation.expect,
            Expectation::Artifact(PathBuf::from("/tmp/audio/preview/doc/gen.wav"))
        );
    }

    #[test]
    fn test_convert_image_appends_tga() {
        let invocation =
            commands::convert_image(Path::new("ffmpeg"), Path::new("/tmp/source/a/photo.jpg"));
        assert_eq!(
            invocation.args,
            vec!["-y", "-i", "/tmp/source/a/photo.jpg", "/tmp/source/a/photo.jpg.tga"]
        );
        assert_eq!(invocation.tool_name(), "ffmpeg");
    }

    #[test]
    fn test_parse_scalar() {
        assert_eq!(parse_scalar("61.752000\n"), Some(61.752));
        assert_eq!(parse_scalar("\n  12\n"), Some(12.0));
        assert_eq!(parse_scalar("N/A\n"), None);
        assert_eq!(parse_scalar(""), None);
        assert_eq!(parse_scalar("inf"), None);
    }

    #[tokio::test]
    async fn test_artifact_presence_overrides_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("out.wav");
        std::fs::write(&artifact, b"RIFF").unwrap();

        let output = judge(
            "ffmpeg",
            &Expectation::Artifact(artifact.clone()),
            Some(1),
            "",
            String::new(),
        )
        .await
        .unwrap();
        assert_eq!(output.artifact, Some(artifact));
    }

    #[tokio::test]
    async fn test_clean_exit_without_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = judge(
            "ffmpeg",
            &Expectation::Artifact(dir.path().join("missing.wav")),
            Some(0),
            "",
            String::new(),
        )
        .await;
        assert!(matches!(result, Err(ToolError::NoArtifact { .. })));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = ProcessToolRunner::new(&ToolsConfig::default());
        let invocation = ToolInvocation::new(
            "nonexistent_tool_xyz_12345",
            Expectation::ScalarStdout,
        );
        let result = runner.invoke(&invocation).await;
        assert!(matches!(result, Err(ToolError::Spawn { .. })));
    }

    fn runner_with(max_concurrent_invocations: usize, timeout_secs: u64) -> ProcessToolRunner {
        ProcessToolRunner::new(&ToolsConfig {
            max_concurrent_invocations,
            timeout_secs,
            ..ToolsConfig::default()
        })
    }

    fn shell(script: &str, expect: Expectation) -> ToolInvocation {
        ToolInvocation::new("sh", expect).arg("-c").arg(script)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_tool_is_killed_on_timeout() {
        let runner = runner_with(1, 1);
        let started = std::time::Instant::now();

        let result = runner
            .invoke(&shell("sleep 30", Expectation::ScalarStdout))
            .await;

        assert!(matches!(result, Err(ToolError::Timeout { ref tool, .. }) if tool == "sh"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_queue_time_counts_against_deadline() {
        let runner = Arc::new(runner_with(1, 60));
        let deadline = Instant::now() + Duration::from_secs(3);
        let invocation = shell("sleep 2; echo 1", Expectation::ScalarStdout)
            .with_deadline(deadline, Duration::from_secs(2));

        let first = {
            let runner = runner.clone();
            let invocation = invocation.clone();
            tokio::spawn(async move { runner.invoke(&invocation).await })
        };
        // Let the first call take the only slot
        tokio::time::sleep(Duration::from_millis(200)).await;
        let second = runner.invoke(&invocation).await;

        assert_eq!(first.await.unwrap().unwrap().metric, Some(1.0));
        assert!(matches!(second, Err(ToolError::DeadlineExceeded { .. })));
        assert!(Instant::now() <= deadline + Duration::from_millis(500));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_is_cut_off_at_deadline() {
        let runner = runner_with(1, 60);
        let started = Instant::now();
        let invocation = shell("sleep 30", Expectation::ScalarStdout)
            .with_deadline(started + Duration::from_secs(1), Duration::ZERO);

        let result = runner.invoke(&invocation).await;

        assert!(matches!(result, Err(ToolError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_leftover_artifact_does_not_mask_failed_run() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("gen.wav");
        std::fs::write(&artifact, b"OLD PREVIEW").unwrap();

        let runner = runner_with(1, 60);
        let result = runner
            .invoke(&ToolInvocation::new("false", Expectation::Artifact(artifact.clone())))
            .await;

        assert!(matches!(result, Err(ToolError::NoArtifact { exit_code: Some(1), .. })));
        assert!(!artifact.exists());
    }
}
