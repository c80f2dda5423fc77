//! Configuration module for image compose runs.
//!
//! A compose run reads three read-only inputs, each parsed once at startup:
//!
//! - `loader`: the ini dialect shared by the task config and `oz.cfg`, plus
//!   the engine's JSON configuration file
//! - `overrides`: the engine override map derived from `oz.cfg`
//! - this module: the per-release task configuration (`config.ini`)
//!
//! # Task config layout
//!
//! ```text
//! [DEFAULT]
//! os_name = fedora-atomic
//! ostree_repo = /srv/repo
//! ref = %(os_name)s/%(release)s/x86_64/docker-host
//!
//! [rawhide]
//! image_builder = imagefactory
//! ```

pub mod loader;
pub mod overrides;

pub use loader::{load_ini, parse_ini, IniDocument};
pub use overrides::{BuildOverrides, OverrideMap};

use crate::builder::BuilderKind;
use crate::error::ConfigError;
use crate::models::RepoSource;
use crate::template::VariantProfiles;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default wall-clock limit for one engine build call.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(3600);

/// Where the direct engine finds its own configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// JSON engine configuration (`imagefactory.conf`)
    pub config_path: PathBuf,
    /// Plugin directory handed to the engine
    pub plugins_dir: PathBuf,
    /// ini file the build overrides are derived from (`oz.cfg`)
    pub overrides_path: PathBuf,
    /// Per-call wall-clock timeout
    pub timeout: Duration,
    /// Disk format the engine uses for rhevm images
    pub rhevm_image_format: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            config_path: PathBuf::from("/etc/imagefactory/imagefactory.conf"),
            plugins_dir: PathBuf::from("/etc/imagefactory/plugins.d"),
            overrides_path: PathBuf::from("/etc/oz/oz.cfg"),
            timeout: DEFAULT_BUILD_TIMEOUT,
            rhevm_image_format: "qcow2".to_string(),
        }
    }
}

/// Settings for one release section of the task config.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub release: String,
    pub source: RepoSource,
    /// Parent directory for the temporary work directory
    pub workdir: Option<PathBuf>,
    pub builder: BuilderKind,
    pub engine: EngineSettings,
    pub kickstart_versions: VariantProfiles,
}

impl TaskConfig {
    /// Load the section named after `release` from an ini file.
    pub fn load(path: &Path, release: &str) -> Result<Self, ConfigError> {
        let mut doc = load_ini(path)?;
        doc.set_default("release", release);
        Self::from_document(&doc, release)
    }

    pub fn from_document(doc: &IniDocument, release: &str) -> Result<Self, ConfigError> {
        if !doc.has_section(release) {
            return Err(ConfigError::MissingSection(release.to_string()));
        }

        let source = RepoSource {
            repo_path: PathBuf::from(doc.require(release, "ostree_repo")?),
            ostree_ref: doc.require(release, "ref")?,
            os_name: doc.require(release, "os_name")?,
        };

        let builder = match doc.get(release, "image_builder")? {
            Some(value) => value.parse()?,
            None => BuilderKind::default(),
        };

        let mut engine = EngineSettings::default();
        if let Some(path) = doc.get(release, "imagefactory_config")? {
            engine.config_path = PathBuf::from(path);
        }
        if let Some(path) = doc.get(release, "imagefactory_plugins")? {
            engine.plugins_dir = PathBuf::from(path);
        }
        if let Some(path) = doc.get(release, "oz_config")? {
            engine.overrides_path = PathBuf::from(path);
        }
        if let Some(secs) = doc.get(release, "build_timeout")? {
            let parsed: u64 = secs.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "build_timeout".to_string(),
                value: secs.clone(),
                reason: "expected a number of seconds".to_string(),
            })?;
            engine.timeout = Duration::from_secs(parsed);
        }

        let kickstart_versions = match doc.get(release, "kickstart_versions")? {
            Some(spec) => VariantProfiles::parse(&spec)?,
            None => VariantProfiles::default(),
        };

        Ok(TaskConfig {
            release: release.to_string(),
            source,
            workdir: doc.get(release, "workdir")?.map(PathBuf::from),
            builder,
            engine,
            kickstart_versions,
        })
    }

    /// Human readable summary, one setting per line.
    pub fn summary_lines(&self) -> Vec<String> {
        vec![
            format!("release: {}", self.release),
            format!("ostree_repo: {}", self.source.repo_path.display()),
            format!("ref: {}", self.source.ostree_ref),
            format!("os_name: {}", self.source.os_name),
            format!(
                "workdir: {}",
                self.workdir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(system temp)".to_string())
            ),
            format!("image_builder: {}", self.builder),
            format!("imagefactory_config: {}", self.engine.config_path.display()),
            format!("imagefactory_plugins: {}", self.engine.plugins_dir.display()),
            format!("oz_config: {}", self.engine.overrides_path.display()),
            format!("build_timeout: {}s", self.engine.timeout.as_secs()),
            format!("kickstart_versions: {}", self.kickstart_versions),
        ]
    }

    /// Log the loaded configuration.
    pub fn show_config(&self) {
        for line in self.summary_lines() {
            log::info!("[Config] {}", line);
        }
    }
}
