//! Image builder backends.
//!
//! A backend takes a template plus a [`ParameterBag`] and produces a base
//! image, derives target images from a completed base, and hands finished
//! artifacts back as files. Two backends exist:
//!
//! - `imagefactory`: drives the ImageFactory CLI directly on this host
//! - `koji`: remote build service, recognized but not supported

pub mod imagefactory;
pub mod koji;

pub use imagefactory::DirectEngineBuilder;
pub use koji::RemoteServiceBuilder;

use crate::config::EngineSettings;
use crate::error::{ArtifactError, BuildError, ConfigError};
use crate::log_collector::LogSettings;
use crate::models::{ArtifactStatus, BuildArtifact, ImageTarget, ParameterBag};
use futures::future::BoxFuture;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::watch;

/// Which backend to build with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuilderKind {
    #[default]
    ImageFactory,
    Koji,
}

impl BuilderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuilderKind::ImageFactory => "imagefactory",
            BuilderKind::Koji => "koji",
        }
    }
}

impl fmt::Display for BuilderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuilderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "imagefactory" => Ok(BuilderKind::ImageFactory),
            "koji" => Ok(BuilderKind::Koji),
            other => Err(ConfigError::InvalidValue {
                key: "image_builder".to_string(),
                value: other.to_string(),
                reason: "expected 'imagefactory' or 'koji'".to_string(),
            }),
        }
    }
}

/// Backend contract shared by every image builder.
pub trait ImageBuilder: Send + Sync {
    fn kind(&self) -> BuilderKind;

    /// Build a base image from template text.
    fn build<'a>(
        &'a self,
        template: &'a str,
        parameters: &'a ParameterBag,
    ) -> BoxFuture<'a, Result<BuildArtifact, BuildError>>;

    /// Derive a target image from a completed artifact.
    fn build_image_type<'a>(
        &'a self,
        target: ImageTarget,
        base_id: &'a str,
        parameters: &'a ParameterBag,
    ) -> BoxFuture<'a, Result<BuildArtifact, BuildError>>;

    /// Copy a completed artifact's data to `dest`.
    fn download<'a>(
        &'a self,
        artifact: &'a BuildArtifact,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<(), ArtifactError>>;
}

/// Reject any artifact that did not finish `COMPLETE`.
pub fn require_complete(artifact: BuildArtifact, target: &str) -> Result<BuildArtifact, BuildError> {
    if artifact.status == ArtifactStatus::Complete {
        Ok(artifact)
    } else {
        Err(BuildError::Failed {
            target: target.to_string(),
            status: artifact.status_text(),
        })
    }
}

/// Construct the configured backend.
pub fn create_builder(
    kind: BuilderKind,
    settings: &EngineSettings,
    scratch_parent: Option<&Path>,
    logging: &LogSettings,
    cancel_rx: watch::Receiver<bool>,
) -> Result<Box<dyn ImageBuilder>, ConfigError> {
    match kind {
        BuilderKind::ImageFactory => {
            let builder = DirectEngineBuilder::new(settings.clone(), scratch_parent, logging)?
                .with_cancel(cancel_rx);
            Ok(Box::new(builder))
        }
        BuilderKind::Koji => {
            log::warn!("[Builder] The koji backend cannot build images; every build will fail");
            Ok(Box::new(RemoteServiceBuilder::new()))
        }
    }
}
