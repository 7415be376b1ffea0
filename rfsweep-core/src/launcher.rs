//! Process launching for stage invocations.
//!
//! [`Launcher`] is the seam between the orchestrator and the operating
//! system. [`ProcessLauncher`] spawns real children; [`MockLauncher`] records
//! calls and replays scripted exit codes for tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StageError;
use crate::stage::{Invocation, Stage};

/// How a single child is supervised.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Working directory; relative layout paths resolve against it.
    pub current_dir: PathBuf,
    /// Kill the child after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Pipe and collect stdout/stderr instead of inheriting them.
    pub capture: bool,
}

/// What a finished child left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit status, or -1 when the child was killed by a signal or timeout.
    pub exit_code: i32,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }
}

/// Starts an invocation and blocks until it is done.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Run `invocation` to completion.
    ///
    /// A non-zero exit is a successful launch; only failing to start or being
    /// cancelled is an error.
    async fn launch(
        &self,
        invocation: &Invocation,
        options: &LaunchOptions,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, StageError>;
}

/// How long output readers may keep draining after the child is gone.
///
/// Descendants that inherited the pipes can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Launches invocations as child processes.
///
/// On unix each child leads its own process group, so a timeout or
/// cancellation also kills the workers it forked.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        invocation: &Invocation,
        options: &LaunchOptions,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, StageError> {
        let stage = invocation.stage;
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        if !options.current_dir.as_os_str().is_empty() {
            cmd.current_dir(&options.current_dir);
        }
        for (key, value) in invocation.env.iter() {
            cmd.env(key, value);
        }
        if options.capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }

        let mut child = cmd.spawn().map_err(|e| StageError::Spawn {
            stage,
            program: invocation.program.clone(),
            message: e.to_string(),
        })?;
        debug!(stage = %stage, pid = ?child.id(), "Spawned stage process");

        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(collect_lines(pipe, stage, false)));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(collect_lines(pipe, stage, true)));

        let waited = tokio::select! {
            waited = wait_with_timeout(&mut child, options.timeout) => waited,
            _ = cancel.cancelled() => {
                warn!(stage = %stage, "Cancellation requested, killing stage process");
                terminate(&mut child).await;
                abort_readers(stdout_task, stderr_task);
                return Err(StageError::Cancelled { stage });
            }
        };

        let (exit_code, timed_out) = match waited {
            Ok(Some(status)) => (status.code().unwrap_or(-1), false),
            Ok(None) => {
                warn!(
                    stage = %stage,
                    timeout_secs = options.timeout.map(|t| t.as_secs()),
                    "Stage timed out, killing process"
                );
                terminate(&mut child).await;
                (-1, true)
            }
            Err(e) => {
                terminate(&mut child).await;
                abort_readers(stdout_task, stderr_task);
                return Err(StageError::Spawn {
                    stage,
                    program: invocation.program.clone(),
                    message: format!("failed to wait for process: {e}"),
                });
            }
        };

        Ok(ProcessOutput {
            exit_code,
            stdout: join_lines(stdout_task, stage).await,
            stderr: join_lines(stderr_task, stage).await,
            timed_out,
        })
    }
}

/// Kill the child and, on unix, every process in its group.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // A negative pid addresses the whole group the child leads.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
    let _ = child.kill().await;
}

fn abort_readers(stdout: Option<JoinHandle<String>>, stderr: Option<JoinHandle<String>>) {
    for task in [stdout, stderr].into_iter().flatten() {
        task.abort();
    }
}

/// Wait for the child, giving up after `timeout`. `Ok(None)` means it timed out.
async fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
) -> std::io::Result<Option<ExitStatus>> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status.map(Some),
            Err(_) => Ok(None),
        },
        None => child.wait().await.map(Some),
    }
}

/// Forward each line to the log and keep it for the report.
///
/// Lines are decoded lossily and the pipe is drained to EOF, so stray
/// non-UTF-8 output never closes it under a running child.
async fn collect_lines<R>(pipe: R, stage: Stage, is_stderr: bool) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                debug!(stage = %stage, stderr = is_stderr, "{line}");
                lines.push(line);
            }
            Err(e) => {
                warn!(
                    stage = %stage,
                    stderr = is_stderr,
                    error = %e,
                    "Failed to read stage output"
                );
                break;
            }
        }
    }
    lines.join("\n")
}

/// Collect a reader's output, abandoning it after [`DRAIN_GRACE`].
async fn join_lines(task: Option<JoinHandle<String>>, stage: Stage) -> Option<String> {
    let mut handle = task?;
    match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
        Ok(joined) => joined.ok(),
        Err(_) => {
            warn!(stage = %stage, "Stage output still open after exit, dropping the rest");
            handle.abort();
            Some(String::new())
        }
    }
}

/// Test launcher that records every call and replays scripted results.
///
/// Calls beyond the script exit 0.
#[derive(Debug, Default)]
pub struct MockLauncher {
    script: Mutex<VecDeque<Result<ProcessOutput, StageError>>>,
    calls: Mutex<Vec<Invocation>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue plain exit codes, one per upcoming call.
    pub fn with_exit_codes(self, codes: impl IntoIterator<Item = i32>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(codes.into_iter().map(|c| Ok(ProcessOutput::exited(c))));
        }
        self
    }

    /// Queue an arbitrary result for the next unscripted call.
    pub fn push_result(&self, result: Result<ProcessOutput, StageError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(result);
        }
    }

    /// Every invocation launched so far, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(
        &self,
        invocation: &Invocation,
        _options: &LaunchOptions,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, StageError> {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled {
                stage: invocation.stage,
            });
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.clone());
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| Ok(ProcessOutput::exited(0)))
    }
}
