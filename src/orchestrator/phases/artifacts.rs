//! Artifact placement: finished images land in the output directory.
//!
//! - `<name>.qcow2`: the base image, always
//! - `<name>.raw`: converted locally from `<name>.qcow2`
//! - `<name>-<format>.ova`: packaged target images

use crate::builder::ImageBuilder;
use crate::error::ArtifactError;
use crate::models::{BuildArtifact, BuildTask, FormatTag};
use crate::system::{DiskFormat, ImageConverter};
use std::path::PathBuf;

pub async fn place_base(
    builder: &dyn ImageBuilder,
    base: &BuildArtifact,
    task: &BuildTask,
) -> Result<PathBuf, ArtifactError> {
    let dest = task.base_output();
    builder.download(base, &dest).await?;
    Ok(dest)
}

/// Convert the placed qcow2 base image to raw.
pub async fn convert_raw(
    converter: &dyn ImageConverter,
    task: &BuildTask,
) -> Result<PathBuf, ArtifactError> {
    let source = task.base_output();
    let dest = task.raw_output();
    converter
        .convert(&source, DiskFormat::Qcow2, &dest, DiskFormat::Raw)
        .await?;
    log::info!("[Artifacts] Created: {}", dest.display());
    Ok(dest)
}

pub async fn place_ova(
    builder: &dyn ImageBuilder,
    ova: &BuildArtifact,
    task: &BuildTask,
    format: FormatTag,
) -> Result<PathBuf, ArtifactError> {
    let dest = task.ova_output(format);
    builder.download(ova, &dest).await?;
    Ok(dest)
}
