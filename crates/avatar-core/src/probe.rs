use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use crate::config::ProbeConfig;

pub type ProbeFuture = Pin<Box<dyn Future<Output = Option<f64>> + Send>>;

/// Best-effort media length lookup. Never fails; unknown is `None`.
pub trait DurationProbe: Send + Sync {
    fn probe_duration(&self, audio_url: &str) -> ProbeFuture;
}

/// Probe that never knows the duration.
pub struct NoDurationProbe;

impl DurationProbe for NoDurationProbe {
    fn probe_duration(&self, _audio_url: &str) -> ProbeFuture {
        Box::pin(async { None })
    }
}

pub struct FfprobeDurationProbe {
    program: String,
    timeout: Duration,
}

impl FfprobeDurationProbe {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(config.program.clone(), config.timeout())
    }
}

impl DurationProbe for FfprobeDurationProbe {
    fn probe_duration(&self, audio_url: &str) -> ProbeFuture {
        let program = self.program.clone();
        let timeout = self.timeout;
        let input = audio_url
            .trim()
            .strip_prefix("file://")
            .unwrap_or(audio_url.trim())
            .to_string();

        Box::pin(async move {
            let mut command = tokio::process::Command::new(&program);
            command
                .args([
                    "-v",
                    "error",
                    "-show_entries",
                    "format=duration",
                    "-of",
                    "default=noprint_wrappers=1:nokey=1",
                ])
                .arg(&input)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let output = match tokio::time::timeout(timeout, command.output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(error)) => {
                    tracing::warn!(program = %program, input = %input, error = %error, "failed to run duration probe");
                    return None;
                }
                Err(_) => {
                    tracing::warn!(
                        program = %program,
                        input = %input,
                        timeout_ms = timeout.as_millis() as u64,
                        "duration probe timed out"
                    );
                    return None;
                }
            };

            if !output.status.success() {
                tracing::warn!(
                    program = %program,
                    input = %input,
                    status = ?output.status.code(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "duration probe exited unsuccessfully"
                );
                return None;
            }

            let duration = parse_probe_output(&String::from_utf8_lossy(&output.stdout));
            if duration.is_none() {
                tracing::warn!(input = %input, "duration probe printed no usable duration");
            }
            duration
        })
    }
}

/// Takes the first line that parses as a finite, non-negative number of seconds.
pub fn parse_probe_output(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<f64>().ok())
        .find(|seconds| seconds.is_finite() && *seconds >= 0.0)
}
