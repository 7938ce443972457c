//! Process execution of synthesized programs.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::ExecutionConfig;
use super::result::ProcessOutcome;
use crate::workspace::Workspace;

/// How long to wait for the output readers after the process is gone.
/// Only a descendant that escaped the process group can hold a pipe open
/// past this point.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Runs a program file that has already been written into a workspace.
///
/// Implementations never fail: launch problems, timeouts and cancellation
/// are all reported inside the returned [`ProcessOutcome`].
#[async_trait]
pub trait ProgramExecutor: Send + Sync {
    async fn run(
        &self,
        program_path: &Path,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> ProcessOutcome;
}

/// Spawns `interpreter [args] <program>` as a child process.
///
/// The child gets the workspace root as its working directory, null
/// stdin, and piped stdout/stderr that are drained concurrently so a
/// chatty program cannot deadlock on a full pipe. On unix the child leads
/// its own process group; on timeout or cancellation the whole group is
/// sent SIGKILL and the child is reaped before returning.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    config: ExecutionConfig,
}

impl ProcessExecutor {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    fn command(&self, program_path: &Path, workspace: &Workspace) -> Command {
        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.interpreter_args)
            .arg(program_path)
            .current_dir(workspace.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

enum Ended {
    Exited(Option<i32>),
    WaitFailed(std::io::Error),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ProgramExecutor for ProcessExecutor {
    async fn run(
        &self,
        program_path: &Path,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> ProcessOutcome {
        let start = Instant::now();

        if cancel.is_cancelled() {
            return ProcessOutcome::cancelled(String::new());
        }

        let mut child = match self.command(program_path, workspace).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(interpreter = %self.config.interpreter, error = %e, "Failed to launch program");
                return ProcessOutcome::launch_fault(format!(
                    "failed to launch '{}': {}",
                    self.config.interpreter, e
                ))
                .with_duration(start.elapsed());
            }
        };

        let pid = child.id();
        info!(
            pid = pid.unwrap_or_default(),
            program = %program_path.display(),
            timeout_secs = self.config.timeout.as_secs(),
            "Program started"
        );

        let max = self.config.max_output_bytes;
        let stdout_reader = child.stdout.take().map(|s| tokio::spawn(read_tail(s, max)));
        let stderr_reader = child.stderr.take().map(|s| tokio::spawn(read_tail(s, max)));

        let ended = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Ended::Exited(status.code()),
                Err(e) => Ended::WaitFailed(e),
            },
            _ = tokio::time::sleep(self.config.timeout) => Ended::TimedOut,
            _ = cancel.cancelled() => Ended::Cancelled,
        };

        // Stragglers in the group are killed on every path so no
        // background descendant outlives the attempt.
        terminate(&mut child, pid).await;

        let stdout = drain(stdout_reader).await;
        let stderr = drain(stderr_reader).await;
        let duration = start.elapsed();

        match ended {
            Ended::Exited(code) => {
                info!(exit_code = ?code, elapsed_ms = duration.as_millis() as u64, "Program exited");
                ProcessOutcome {
                    exit_code: code,
                    stdout,
                    stderr,
                    fault: None,
                    duration,
                }
            }
            Ended::WaitFailed(e) => {
                warn!(error = %e, "Failed waiting on program");
                ProcessOutcome::launch_fault(format!("failed to wait on program: {}", e))
                    .with_duration(duration)
            }
            Ended::TimedOut => {
                warn!(timeout_secs = self.config.timeout.as_secs(), "Program timed out, killed");
                ProcessOutcome::timed_out(self.config.timeout, stdout).with_duration(duration)
            }
            Ended::Cancelled => {
                info!("Program cancelled, killed");
                ProcessOutcome::cancelled(stdout).with_duration(duration)
            }
        }
    }
}

/// Kills the child's process group and reaps the child.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.start_kill() {
        // Already exited is the common case here.
        debug!(error = %e, "start_kill");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "Failed to reap program");
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group id came from a child
    // we spawned as a group leader.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "killpg");
    }
}

/// Reads a stream to EOF, keeping at most the last `max` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, max: usize) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > max.saturating_mul(2) {
                    let excess = kept.len() - max;
                    kept.drain(..excess);
                }
            }
            Err(e) => {
                debug!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
    if kept.len() > max {
        let excess = kept.len() - max;
        kept.drain(..excess);
    }
    kept
}

async fn drain(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(mut handle) = reader else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            warn!("Output pipe still open after process exit, abandoning reader");
            handle.abort();
            String::new()
        }
    }
}
