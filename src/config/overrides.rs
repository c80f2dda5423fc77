//! Engine override map derived from the engine's own ini configuration.
//!
//! Two settings are checked:
//! - `libvirt.image_type` is always forced to `qcow2`, whatever the file says.
//!   Every compose produces a KVM-style qcow2 base image and derives the other
//!   formats from it.
//! - `libvirt.memory` below [`MIN_MEMORY_MB`] is raised to the minimum with a
//!   warning. Undersized guests fail late inside the engine with opaque errors.

use crate::config::loader::{load_ini, IniDocument};
use crate::error::ConfigError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Image container format applied to every build.
pub const DEFAULT_IMAGE_TYPE: &str = "qcow2";

/// Smallest guest memory allocation (MiB) the install is reliable with.
pub const MIN_MEMORY_MB: u64 = 2048;

const LIBVIRT_SECTION: &str = "libvirt";

/// Section -> key -> value overrides, serialized as JSON for the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OverrideMap(BTreeMap<String, BTreeMap<String, serde_json::Value>>);

impl OverrideMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, section: &str, key: &str, value: impl Into<serde_json::Value>) {
        self.0
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&serde_json::Value> {
        self.0.get(section).and_then(|s| s.get(key))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::Value::from(self).to_string()
    }
}

impl From<&OverrideMap> for serde_json::Value {
    fn from(map: &OverrideMap) -> Self {
        serde_json::to_value(map).unwrap_or(serde_json::Value::Null)
    }
}

/// Override computation over an engine ini document.
pub struct BuildOverrides;

impl BuildOverrides {
    /// Read the engine ini file and compute its overrides.
    pub fn load(path: &Path) -> Result<OverrideMap, ConfigError> {
        let doc = load_ini(path)?;
        Self::compute(&doc)
    }

    pub fn compute(source: &IniDocument) -> Result<OverrideMap, ConfigError> {
        let mut overrides = OverrideMap::new();

        Self::apply_default_image_type(&mut overrides);

        match Self::configured_memory(source)? {
            Some(memory) if memory >= MIN_MEMORY_MB => {
                log::debug!("[Overrides] libvirt memory {} MiB is sufficient", memory);
            }
            Some(memory) => {
                log::warn!(
                    "Your current engine configuration ({}) specifies a memory amount of {} MiB, \
                     less than {} MiB, which can lead to image creation failures. \
                     Overriding temporarily to {}",
                    source.origin(),
                    memory,
                    MIN_MEMORY_MB,
                    MIN_MEMORY_MB
                );
                overrides.add(LIBVIRT_SECTION, "memory", MIN_MEMORY_MB);
            }
            None => {
                log::warn!(
                    "No libvirt memory set in {}; the engine default is below {} MiB. \
                     Overriding temporarily to {}",
                    source.origin(),
                    MIN_MEMORY_MB,
                    MIN_MEMORY_MB
                );
                overrides.add(LIBVIRT_SECTION, "memory", MIN_MEMORY_MB);
            }
        }

        Ok(overrides)
    }

    fn apply_default_image_type(overrides: &mut OverrideMap) {
        overrides.add(LIBVIRT_SECTION, "image_type", DEFAULT_IMAGE_TYPE);
    }

    fn configured_memory(source: &IniDocument) -> Result<Option<u64>, ConfigError> {
        let raw = match source.get(LIBVIRT_SECTION, "memory")? {
            Some(value) => value,
            None => return Ok(None),
        };
        raw.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: "libvirt.memory".to_string(),
                value: raw.clone(),
                reason: "expected an integer number of MiB".to_string(),
            })
    }
}
