//! External command execution.
//!
//! Every external tool (flattener, converter, repository CLI, build engine)
//! goes through [`run_command`]: stdout and stderr are streamed line by line
//! into the log while the command runs, and the call can be bounded by a
//! timeout and interrupted through a cancellation channel. A cancelled or
//! timed out child is killed and reaped before returning.

use crate::error::CommandError;
use std::future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;

/// Per-call execution options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Log prefix for streamed output lines
    pub label: String,
    /// Level streamed output lines are logged at
    pub level: log::Level,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Cancellation flag; the command is killed once it flips to `true`
    pub cancel: Option<watch::Receiver<bool>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            label: "Exec".to_string(),
            level: log::Level::Debug,
            cwd: None,
            timeout: None,
            cancel: None,
        }
    }
}

impl RunOptions {
    pub fn labelled(label: impl Into<String>) -> Self {
        RunOptions {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: log::Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Last non-empty stderr line, for error messages.
    pub fn last_error_line(&self) -> Option<&str> {
        self.stderr
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
    }
}

/// Run `cmd` to completion, streaming its output into the log.
///
/// A non-zero exit is not an error here; callers inspect
/// [`CommandOutput::status`].
pub async fn run_command(mut cmd: Command, opts: RunOptions) -> Result<CommandOutput, CommandError> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();

    if opts.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false) {
        return Err(CommandError::Cancelled);
    }

    if let Some(ref cwd) = opts.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    log::debug!("[{}] Running {:?}", opts.label, cmd.as_std());

    let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
        program: program.clone(),
        source,
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CommandError::Io(std::io::Error::other("failed to capture stdout")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| CommandError::Io(std::io::Error::other("failed to capture stderr")))?;

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut captured_stdout = Vec::new();
    let mut captured_stderr = Vec::new();
    let mut stdout_closed = false;
    let mut stderr_closed = false;

    let deadline = opts.timeout.map(|limit| Instant::now() + limit);
    let expiry = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => future::pending::<()>().await,
        }
    };
    tokio::pin!(expiry);

    let mut cancel = opts.cancel.clone();
    let mut cancel_open = cancel.is_some();

    loop {
        let streams_done = stdout_closed && stderr_closed;

        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_closed => {
                match line {
                    Ok(Some(line)) => {
                        log::log!(opts.level, "[{}] {}", opts.label, line);
                        captured_stdout.push(line);
                    }
                    Ok(None) => stdout_closed = true,
                    Err(e) => {
                        log::warn!("[{}] stdout read error: {}", opts.label, e);
                        stdout_closed = true;
                    }
                }
            }
            line = stderr_lines.next_line(), if !stderr_closed => {
                match line {
                    Ok(Some(line)) => {
                        log::log!(opts.level, "[{}] [STDERR] {}", opts.label, line);
                        captured_stderr.push(line);
                    }
                    Ok(None) => stderr_closed = true,
                    Err(e) => {
                        log::warn!("[{}] stderr read error: {}", opts.label, e);
                        stderr_closed = true;
                    }
                }
            }
            status = child.wait(), if streams_done => {
                let status = status?;
                log::debug!("[{}] {} exited with {}", opts.label, program, status);
                return Ok(CommandOutput {
                    status,
                    stdout: captured_stdout,
                    stderr: captured_stderr,
                });
            }
            changed = cancel_signal(&mut cancel), if cancel_open => {
                match changed {
                    Some(true) => {
                        log::warn!("[{}] Cancellation requested, killing {}", opts.label, program);
                        terminate(&mut child).await;
                        return Err(CommandError::Cancelled);
                    }
                    Some(false) => {}
                    // Sender gone: no cancellation can arrive any more.
                    None => cancel_open = false,
                }
            }
            _ = &mut expiry => {
                let limit = opts.timeout.unwrap_or_default();
                log::error!(
                    "[{}] {} exceeded {}s, killing it",
                    opts.label,
                    program,
                    limit.as_secs()
                );
                terminate(&mut child).await;
                return Err(CommandError::TimedOut(limit));
            }
        }
    }
}

async fn cancel_signal(rx: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow()),
            Err(_) => None,
        },
        None => future::pending().await,
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        log::debug!("[Exec] kill failed: {}", e);
    }
    let _ = child.wait().await;
}
