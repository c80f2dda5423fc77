//! Remote build service backend.
//!
//! Selectable through `image_builder = koji` but has no client yet: every
//! operation fails with [`BuildError::Unsupported`].

use super::{BuilderKind, ImageBuilder};
use crate::error::{ArtifactError, BuildError};
use crate::models::{BuildArtifact, ImageTarget, ParameterBag};
use futures::future::BoxFuture;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct RemoteServiceBuilder;

impl RemoteServiceBuilder {
    pub fn new() -> Self {
        RemoteServiceBuilder
    }

    fn unsupported() -> BuildError {
        BuildError::Unsupported(BuilderKind::Koji.to_string())
    }
}

impl ImageBuilder for RemoteServiceBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Koji
    }

    fn build<'a>(
        &'a self,
        _template: &'a str,
        _parameters: &'a ParameterBag,
    ) -> BoxFuture<'a, Result<BuildArtifact, BuildError>> {
        Box::pin(async { Err(Self::unsupported()) })
    }

    fn build_image_type<'a>(
        &'a self,
        _target: ImageTarget,
        _base_id: &'a str,
        _parameters: &'a ParameterBag,
    ) -> BoxFuture<'a, Result<BuildArtifact, BuildError>> {
        Box::pin(async { Err(Self::unsupported()) })
    }

    fn download<'a>(
        &'a self,
        artifact: &'a BuildArtifact,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<(), ArtifactError>> {
        Box::pin(async move {
            Err(ArtifactError::Copy {
                from: artifact.data_path.clone(),
                to: dest.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "koji artifacts cannot be downloaded",
                ),
            })
        })
    }
}
