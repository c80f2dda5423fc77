//! Commit lookup through the `ostree` CLI.

use crate::error::ServiceError;
use crate::models::CommitInfo;
use crate::orchestrator::executor::{run_command, CommandOutput, RunOptions};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use tokio::process::Command;

const SHOW_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

/// Resolves a ref in a repository to its current commit.
pub trait CommitResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        repo: &'a Path,
        reference: &'a str,
    ) -> BoxFuture<'a, Result<CommitInfo, ServiceError>>;
}

#[derive(Debug, Clone)]
pub struct OstreeCli {
    program: PathBuf,
}

impl Default for OstreeCli {
    fn default() -> Self {
        OstreeCli {
            program: PathBuf::from("ostree"),
        }
    }
}

impl OstreeCli {
    pub fn new() -> Self {
        Self::default()
    }

    async fn ostree(&self, repo: &Path, args: &[&str], reference: &str) -> Result<CommandOutput, ServiceError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(format!("--repo={}", repo.display())).args(args);

        let output = run_command(cmd, RunOptions::labelled("ostree"))
            .await
            .map_err(|e| resolution_error(reference, e.to_string()))?;
        if !output.success() {
            return Err(resolution_error(
                reference,
                output
                    .last_error_line()
                    .unwrap_or("ostree exited unsuccessfully")
                    .to_string(),
            ));
        }
        Ok(output)
    }

    async fn resolve_inner(&self, repo: &Path, reference: &str) -> Result<CommitInfo, ServiceError> {
        let rev_output = self.ostree(repo, &["rev-parse", reference], reference).await?;
        let revision = rev_output
            .stdout
            .iter()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .ok_or_else(|| resolution_error(reference, "rev-parse printed nothing".to_string()))?
            .to_string();

        let show_output = self.ostree(repo, &["show", &revision], reference).await?;
        let timestamp = parse_show_date(&show_output.stdout)
            .ok_or_else(|| resolution_error(reference, "no Date: line in commit metadata".to_string()))?;

        Ok(CommitInfo {
            ostree_ref: reference.to_string(),
            revision,
            timestamp,
        })
    }
}

impl CommitResolver for OstreeCli {
    fn resolve<'a>(
        &'a self,
        repo: &'a Path,
        reference: &'a str,
    ) -> BoxFuture<'a, Result<CommitInfo, ServiceError>> {
        Box::pin(self.resolve_inner(repo, reference))
    }
}

fn resolution_error(reference: &str, reason: String) -> ServiceError {
    ServiceError::CommitResolution {
        reference: reference.to_string(),
        reason,
    }
}

/// Extract the commit date from `ostree show` output.
pub fn parse_show_date(lines: &[String]) -> Option<DateTime<Utc>> {
    lines.iter().find_map(|line| {
        let value = line.trim_start().strip_prefix("Date:")?.trim();
        DateTime::parse_from_str(value, SHOW_DATE_FORMAT)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}
