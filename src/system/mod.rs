//! Host-side tools the pipeline drives: the OSTree content server, the
//! repository CLI, and the disk image converter.

pub mod httpd;
pub mod repo;

pub use httpd::{ContentServer, TrivialHttpd};
pub use repo::{CommitResolver, OstreeCli};

use crate::error::ArtifactError;
use crate::orchestrator::executor::{run_command, RunOptions};
use futures::future::BoxFuture;
use std::fmt;
use std::path::Path;
use tokio::process::Command;

/// Disk image container formats understood by the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Qcow2,
    Raw,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local disk image format conversion.
pub trait ImageConverter: Send + Sync {
    fn convert<'a>(
        &'a self,
        source: &'a Path,
        from: DiskFormat,
        dest: &'a Path,
        to: DiskFormat,
    ) -> BoxFuture<'a, Result<(), ArtifactError>>;
}

/// `qemu-img convert`.
#[derive(Debug, Clone, Default)]
pub struct QemuImg;

impl QemuImg {
    pub fn convert_args(source: &Path, from: DiskFormat, dest: &Path, to: DiskFormat) -> Vec<String> {
        vec![
            "convert".to_string(),
            "-f".to_string(),
            from.as_str().to_string(),
            "-O".to_string(),
            to.as_str().to_string(),
            source.display().to_string(),
            dest.display().to_string(),
        ]
    }
}

impl ImageConverter for QemuImg {
    fn convert<'a>(
        &'a self,
        source: &'a Path,
        from: DiskFormat,
        dest: &'a Path,
        to: DiskFormat,
    ) -> BoxFuture<'a, Result<(), ArtifactError>> {
        Box::pin(async move {
            log::info!(
                "[Convert] {} ({}) -> {} ({})",
                source.display(),
                from,
                dest.display(),
                to
            );
            let mut cmd = Command::new("qemu-img");
            cmd.args(Self::convert_args(source, from, dest, to));

            let output = run_command(cmd, RunOptions::labelled("qemu-img"))
                .await
                .map_err(|e| ArtifactError::Convert(e.to_string()))?;
            if !output.success() {
                return Err(ArtifactError::Convert(format!(
                    "qemu-img exited with {}: {}",
                    output.status,
                    output.last_error_line().unwrap_or("no error output")
                )));
            }
            Ok(())
        })
    }
}

/// Copy a finished image into place, creating the destination directory.
pub async fn place_file(from: &Path, to: &Path) -> Result<u64, ArtifactError> {
    let copy_error = |source| ArtifactError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(copy_error)?;
    }
    let bytes = tokio::fs::copy(from, to).await.map_err(copy_error)?;
    log::info!("[Artifacts] Created: {} ({} bytes)", to.display(), bytes);
    Ok(bytes)
}
