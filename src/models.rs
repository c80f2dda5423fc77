//! Core data types for image composition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

/// Requested output image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    Kvm,
    Raw,
    Vsphere,
    Rhevm,
}

/// How a requested format is produced from the base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatPlan {
    /// The base qcow2 already is the deliverable
    BaseImage,
    /// Converted locally from the base qcow2, no engine round-trip
    Converted,
    /// Engine target build, optionally packaged as an OVA afterwards
    Target { packaged: bool },
}

impl FormatTag {
    /// Every known format, in the default request order.
    pub const ALL: [FormatTag; 4] = [
        FormatTag::Kvm,
        FormatTag::Raw,
        FormatTag::Vsphere,
        FormatTag::Rhevm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FormatTag::Kvm => "kvm",
            FormatTag::Raw => "raw",
            FormatTag::Vsphere => "vsphere",
            FormatTag::Rhevm => "rhevm",
        }
    }

    pub fn plan(&self) -> FormatPlan {
        match self {
            FormatTag::Kvm => FormatPlan::BaseImage,
            FormatTag::Raw => FormatPlan::Converted,
            FormatTag::Vsphere | FormatTag::Rhevm => FormatPlan::Target { packaged: true },
        }
    }

    /// Whether a completed target image of this format gets an OVA package.
    pub fn needs_packaging(&self) -> bool {
        matches!(self.plan(), FormatPlan::Target { packaged: true })
    }

    fn valid_list() -> String {
        let names: Vec<&str> = FormatTag::ALL.iter().map(|f| f.as_str()).collect();
        format!("[{}]", names.join(", "))
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatTag {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FormatTag::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownFormat {
                given: s.to_string(),
                valid: FormatTag::valid_list(),
            })
    }
}

/// Validate the requested image types.
///
/// `None` selects every known format. Duplicates collapse onto their first
/// occurrence and request order is kept.
pub fn parse_image_types(requested: Option<&[String]>) -> Result<Vec<FormatTag>, ConfigError> {
    let requested = match requested {
        None => return Ok(FormatTag::ALL.to_vec()),
        Some(list) => list,
    };

    let mut formats = Vec::with_capacity(requested.len());
    for name in requested {
        let tag: FormatTag = name.parse()?;
        if !formats.contains(&tag) {
            formats.push(tag);
        }
    }
    Ok(formats)
}

/// Engine-side target for a derived build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImageTarget {
    Format(FormatTag),
    Ova,
}

impl ImageTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageTarget::Format(tag) => tag.as_str(),
            ImageTarget::Ova => "ova",
        }
    }
}

impl fmt::Display for ImageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One compose request, immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct BuildTask {
    pub name: String,
    pub template_path: PathBuf,
    pub kickstart_path: PathBuf,
    pub output_dir: PathBuf,
    pub formats: Vec<FormatTag>,
}

impl BuildTask {
    pub fn new(
        name: impl Into<String>,
        template_path: impl Into<PathBuf>,
        kickstart_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        formats: Vec<FormatTag>,
    ) -> Self {
        BuildTask {
            name: name.into(),
            template_path: template_path.into(),
            kickstart_path: kickstart_path.into(),
            output_dir: output_dir.into(),
            formats,
        }
    }

    pub fn wants(&self, format: FormatTag) -> bool {
        self.formats.contains(&format)
    }

    /// `<outputdir>/<name>.qcow2`
    pub fn base_output(&self) -> PathBuf {
        self.output_dir.join(format!("{}.qcow2", self.name))
    }

    /// `<outputdir>/<name>.raw`
    pub fn raw_output(&self) -> PathBuf {
        self.output_dir.join(format!("{}.raw", self.name))
    }

    /// `<outputdir>/<name>-<format>.ova`
    pub fn ova_output(&self, format: FormatTag) -> PathBuf {
        self.output_dir
            .join(format!("{}-{}.ova", self.name, format.as_str()))
    }
}

/// The OSTree repository and ref a compose serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoSource {
    pub repo_path: PathBuf,
    pub ostree_ref: String,
    pub os_name: String,
}

/// A resolved commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub ostree_ref: String,
    pub revision: String,
    pub timestamp: DateTime<Utc>,
}

/// Ordered placeholder-name to value mapping for kickstart rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubstitutionMap {
    entries: Vec<(String, String)>,
}

impl SubstitutionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, keeping the original position of an existing key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Opaque parameters handed to the image builder.
pub type ParameterBag = BTreeMap<String, serde_json::Value>;

/// Lifecycle status of a build artifact as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArtifactStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Pending => "PENDING",
            ArtifactStatus::Running => "RUNNING",
            ArtifactStatus::Complete => "COMPLETE",
            ArtifactStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            ArtifactStatus::Complete | ArtifactStatus::Failed => true,
            ArtifactStatus::Pending | ArtifactStatus::Running => false,
        }
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" | "NEW" => Ok(ArtifactStatus::Pending),
            "RUNNING" | "BUILDING" => Ok(ArtifactStatus::Running),
            "COMPLETE" | "COMPLETED" => Ok(ArtifactStatus::Complete),
            "FAILED" | "FAILURE" => Ok(ArtifactStatus::Failed),
            _ => Err(format!("Unknown artifact status: {}", s)),
        }
    }
}

/// A build output tracked by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildArtifact {
    pub identifier: String,
    pub status: ArtifactStatus,
    /// Backend-provided status text, kept verbatim for diagnostics
    pub status_detail: Option<String>,
    pub data_path: PathBuf,
}

impl BuildArtifact {
    pub fn new(identifier: impl Into<String>, status: ArtifactStatus, data_path: &Path) -> Self {
        BuildArtifact {
            identifier: identifier.into(),
            status,
            status_detail: None,
            data_path: data_path.to_path_buf(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.status_detail = Some(detail.into());
        self
    }

    /// Status string for error reporting: the backend detail when present.
    pub fn status_text(&self) -> String {
        self.status_detail
            .clone()
            .unwrap_or_else(|| self.status.as_str().to_string())
    }
}
