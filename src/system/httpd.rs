//! Local HTTP server exposing the OSTree repository to the installer.
//!
//! The server is a supervised child process, never daemonized: it binds an
//! ephemeral port, reports it through a port file in the work directory, and
//! is terminated explicitly on every pipeline exit path.

use crate::error::ServiceError;
use futures::future::BoxFuture;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// Name of the port file written into the work directory.
pub const PORT_FILE_NAME: &str = "repo-port";

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A server publishing a repository over HTTP.
pub trait ContentServer: Send {
    /// Start serving `repo`; returns the bound port.
    fn start<'a>(
        &'a mut self,
        repo: &'a Path,
        workdir: &'a Path,
    ) -> BoxFuture<'a, Result<u16, ServiceError>>;

    /// Stop serving. Safe to call when never started or already stopped.
    fn stop(&mut self) -> BoxFuture<'_, ()>;

    fn port(&self) -> Option<u16>;
}

/// `ostree trivial-httpd` running as a child process.
pub struct TrivialHttpd {
    command: Vec<String>,
    port_timeout: Duration,
    stop_grace: Duration,
    child: Option<Child>,
    port: Option<u16>,
}

impl Default for TrivialHttpd {
    fn default() -> Self {
        TrivialHttpd {
            command: vec!["ostree".to_string()],
            port_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
            child: None,
            port: None,
        }
    }
}

impl TrivialHttpd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the `ostree` invocation (program plus leading arguments).
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        if !command.is_empty() {
            self.command = command;
        }
        self
    }

    pub fn with_port_timeout(mut self, timeout: Duration) -> Self {
        self.port_timeout = timeout;
        self
    }

    pub fn port_file(workdir: &Path) -> PathBuf {
        workdir.join(PORT_FILE_NAME)
    }

    fn build_command(&self, repo: &Path, port_file: &Path) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .arg("trivial-httpd")
            .arg("--autoexit")
            .arg("--port-file")
            .arg(port_file)
            .arg("-p")
            .arg("0")
            .current_dir(repo)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn wait_for_port(&mut self, port_file: &Path) -> Result<u16, ServiceError> {
        let deadline = tokio::time::Instant::now() + self.port_timeout;

        loop {
            if let Ok(content) = tokio::fs::read_to_string(port_file).await {
                if !content.trim().is_empty() {
                    return parse_port_file(&content);
                }
            }

            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(ServiceError::Bind(format!(
                        "trivial-httpd exited with {} before reporting a port",
                        status
                    )));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ServiceError::Bind(format!(
                    "no port reported in {} within {}s",
                    port_file.display(),
                    self.port_timeout.as_secs_f32()
                )));
            }
            tokio::time::sleep(PORT_POLL_INTERVAL).await;
        }
    }

    async fn start_inner(&mut self, repo: &Path, workdir: &Path) -> Result<u16, ServiceError> {
        if self.child.is_some() {
            return Err(ServiceError::Bind("server already running".to_string()));
        }

        let port_file = Self::port_file(workdir);
        // A stale port file would be read back as the new port.
        let _ = tokio::fs::remove_file(&port_file).await;

        log::info!("[Serve] Starting trivial-httpd for {}", repo.display());
        let mut child = self
            .build_command(repo, &port_file)
            .spawn()
            .map_err(|e| ServiceError::Bind(format!("failed to spawn {}: {}", self.command[0], e)))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("[Serve] [STDERR] {}", line);
                }
            });
        }
        self.child = Some(child);

        match self.wait_for_port(&port_file).await {
            Ok(port) => {
                log::info!("[Serve] Repository served on port {}", port);
                self.port = Some(port);
                Ok(port)
            }
            Err(e) => {
                self.stop_inner().await;
                Err(e)
            }
        }
    }

    async fn stop_inner(&mut self) {
        self.port = None;
        let mut child = match self.child.take() {
            Some(child) => child,
            None => return,
        };

        if let Ok(Some(_)) = child.try_wait() {
            log::debug!("[Serve] trivial-httpd already exited");
            return;
        }

        if let Some(pid) = child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                log::debug!("[Serve] SIGTERM to {} failed: {}", pid, e);
            }
        }

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(_) => log::info!("[Serve] trivial-httpd stopped"),
            Err(_) => {
                log::warn!(
                    "[Serve] trivial-httpd ignored SIGTERM for {}s, killing it",
                    self.stop_grace.as_secs()
                );
                if let Err(e) = child.kill().await {
                    log::warn!("[Serve] Failed to kill trivial-httpd: {}", e);
                }
            }
        }
    }
}

impl ContentServer for TrivialHttpd {
    fn start<'a>(
        &'a mut self,
        repo: &'a Path,
        workdir: &'a Path,
    ) -> BoxFuture<'a, Result<u16, ServiceError>> {
        Box::pin(self.start_inner(repo, workdir))
    }

    fn stop(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.stop_inner())
    }

    fn port(&self) -> Option<u16> {
        self.port
    }
}

/// Parse the decimal port written by the server.
pub fn parse_port_file(content: &str) -> Result<u16, ServiceError> {
    let trimmed = content.trim();
    match trimmed.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ServiceError::Bind(format!(
            "invalid port file content '{}'",
            trimmed
        ))),
    }
}
