//! Counting tool backed by an external executable.

use super::{CountingTool, HitStream, PartitionRequest};
use crate::config::CounterConfig;
use crate::error::{PipelineError, Result};
use crate::merge::HitRecord;
use futures::StreamExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Lines of stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Runs the configured counting executable once per request.
#[derive(Debug, Clone)]
pub struct ProcessTool {
    program: String,
    args: Vec<String>,
}

impl ProcessTool {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &CounterConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    fn command(&self, request: &PartitionRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(request.to_args())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> PipelineError {
        PipelineError::Process {
            program: self.program.clone(),
            status: "not started".to_string(),
            stderr: e.to_string(),
        }
    }
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

fn check_status(program: &str, status: ExitStatus, stderr: &str) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    Err(PipelineError::Process {
        program: program.to_string(),
        status: status.to_string(),
        stderr: tail(stderr),
    })
}

fn collect_stderr<R>(mut stderr: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    })
}

struct LiveRun {
    program: String,
    lines: Lines<BufReader<ChildStdout>>,
    child: Child,
    stderr: JoinHandle<String>,
    lineno: u64,
}

impl LiveRun {
    /// Next hit, or `None` once the tool exits successfully.
    async fn next_hit(mut self) -> Result<Option<(HitRecord, Self)>> {
        loop {
            match self.lines.next_line().await? {
                Some(line) => {
                    self.lineno += 1;
                    let line = line.trim_end();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let hit = HitRecord::parse_line(line).map_err(|reason| PipelineError::Process {
                        program: self.program.clone(),
                        status: format!("malformed output line {}", self.lineno),
                        stderr: reason,
                    })?;
                    return Ok(Some((hit, self)));
                }
                None => {
                    let status = self.child.wait().await?;
                    let stderr = self.stderr.await.unwrap_or_default();
                    check_status(&self.program, status, &stderr)?;
                    return Ok(None);
                }
            }
        }
    }
}

impl CountingTool for ProcessTool {
    async fn count_partition(&self, request: &PartitionRequest, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::debug!(
            "Counting {} partition {} with {}",
            request.sample,
            request.partition,
            self.program
        );

        let out = self
            .command(request)
            .arg("--output")
            .arg(output)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        check_status(&self.program, out.status, &String::from_utf8_lossy(&out.stderr))?;

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(PipelineError::Process {
                program: self.program.clone(),
                status: out.status.to_string(),
                stderr: format!("no output written to {}", output.display()),
            });
        }
        Ok(())
    }

    async fn stream_hits(&self, request: &PartitionRequest) -> Result<HitStream> {
        tracing::debug!(
            "Streaming {} partition {} from {}",
            request.sample,
            request.partition,
            self.program
        );

        let mut child = self
            .command(request)
            .arg("--stream")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.spawn_error(std::io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.spawn_error(std::io::Error::other("stderr not captured")))?;

        let run = LiveRun {
            program: self.program.clone(),
            lines: BufReader::new(stdout).lines(),
            child,
            stderr: collect_stderr(stderr),
            lineno: 0,
        };

        Ok(futures::stream::try_unfold(run, LiveRun::next_hit).boxed())
    }
}
