use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{resolve_relative_to, PipelineConfig};
use crate::logging::{PIPELINE_STDERR_TARGET, PIPELINE_STDOUT_TARGET};

const STDERR_TAIL_LINES: usize = 20;

/// The external image-to-video workflow, treated as a black box.
///
/// Implementations must leave an artifact named `<output_prefix>_*.<ext>` in
/// the configured output directory when they return `Ok`.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn run(&self, input_image: &Path, output_prefix: &str) -> Result<()>;
}

/// Runs the workflow script in its own interpreter process:
/// `<interpreter> <script> --input-image <path> --output-prefix <prefix>`,
/// with the ComfyUI checkout as working directory.
#[derive(Debug, Clone)]
pub struct ScriptPipeline {
    interpreter: String,
    script: PathBuf,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl ScriptPipeline {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            script: resolve_relative_to(&config.comfyui_dir, &config.script),
            working_dir: config.comfyui_dir.clone(),
            timeout: config.timeout(),
        }
    }

    fn command(&self, input_image: &Path, output_prefix: &str) -> Command {
        let mut command = Command::new(&self.interpreter);
        command
            .arg(&self.script)
            .arg("--input-image")
            .arg(input_image)
            .arg("--output-prefix")
            .arg(output_prefix)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Pipeline for ScriptPipeline {
    async fn run(&self, input_image: &Path, output_prefix: &str) -> Result<()> {
        let mut command = self.command(input_image, output_prefix);
        info!(
            interpreter = %self.interpreter,
            script = %self.script.display(),
            input_image = %input_image.display(),
            output_prefix,
            "Running generation pipeline"
        );

        let started = Instant::now();
        let mut child = command.spawn().with_context(|| {
            format!(
                "failed to spawn pipeline '{} {}' in {}",
                self.interpreter,
                self.script.display(),
                self.working_dir.display()
            )
        })?;

        let stdout = child.stdout.take().context("pipeline stdout was not piped")?;
        let stderr = child.stderr.take().context("pipeline stderr was not piped")?;
        let stdout_task = tokio::spawn(forward_stdout(stdout));
        let stderr_task = tokio::spawn(forward_stderr(stderr));

        let waited = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    let _ = child.kill().await;
                    bail!("pipeline timed out after {}s and was killed", limit.as_secs_f64());
                }
            },
            None => child.wait().await,
        };
        let status = waited.context("failed to wait for pipeline process")?;

        let _ = stdout_task.await;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            bail!(
                "pipeline exited with {status}: {}",
                if stderr_tail.is_empty() {
                    "<no stderr>".to_string()
                } else {
                    stderr_tail.join("\n")
                }
            );
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Generation pipeline finished"
        );
        Ok(())
    }
}

async fn forward_stdout<R: AsyncRead + Unpin>(reader: R) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: PIPELINE_STDOUT_TARGET, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(target: PIPELINE_STDOUT_TARGET, "read error: {}", e);
                break;
            }
        }
    }
}

/// Forwards stderr like stdout and keeps the last lines for the error report.
async fn forward_stderr<R: AsyncRead + Unpin>(reader: R) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(target: PIPELINE_STDERR_TARGET, "{}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(target: PIPELINE_STDERR_TARGET, "read error: {}", e);
                break;
            }
        }
    }
    tail.into()
}
