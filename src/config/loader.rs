//! Config file loader for ini-style documents.
//!
//! Handles the ConfigParser dialect used by the compose config and by the
//! engine's own `oz.cfg`:
//! - `[section]` headers and a `[DEFAULT]` fallback section
//! - `key = value` and `key: value` pairs, keys case-insensitive
//! - `#` and `;` comment lines
//! - Indented continuation lines
//! - `%(name)s` interpolation (`%%` for a literal percent sign)

use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Name of the fallback section.
pub const DEFAULT_SECTION: &str = "DEFAULT";

const MAX_INTERPOLATION_DEPTH: usize = 10;

type Section = BTreeMap<String, String>;

/// Parsed ini document.
#[derive(Debug, Clone, Default)]
pub struct IniDocument {
    origin: String,
    defaults: Section,
    sections: BTreeMap<String, Section>,
    order: Vec<String>,
}

impl IniDocument {
    /// Where the document was read from (path or label).
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn has_section(&self, name: &str) -> bool {
        name == DEFAULT_SECTION || self.sections.contains_key(name)
    }

    /// Section names in file order, excluding DEFAULT.
    pub fn sections(&self) -> &[String] {
        &self.order
    }

    /// Add a value to the DEFAULT section unless one is already present.
    pub fn set_default(&mut self, key: &str, value: &str) {
        self.defaults
            .entry(key.to_lowercase())
            .or_insert_with(|| value.to_string());
    }

    /// Raw value lookup: the section first, then DEFAULT.
    pub fn raw(&self, section: &str, key: &str) -> Option<&str> {
        let key = key.to_lowercase();
        self.sections
            .get(section)
            .and_then(|s| s.get(&key))
            .or_else(|| self.defaults.get(&key))
            .map(String::as_str)
    }

    /// Interpolated value lookup.
    pub fn get(&self, section: &str, key: &str) -> Result<Option<String>, ConfigError> {
        match self.raw(section, key) {
            Some(raw) => self.interpolate(section, key, raw, 0).map(Some),
            None => Ok(None),
        }
    }

    /// Interpolated lookup of a setting that must exist.
    pub fn require(&self, section: &str, key: &str) -> Result<String, ConfigError> {
        self.get(section, key)?
            .ok_or_else(|| ConfigError::MissingSetting {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    /// Keys visible from a section (its own plus DEFAULT), sorted.
    pub fn keys(&self, section: &str) -> Vec<String> {
        let mut keys: Vec<String> = self.defaults.keys().cloned().collect();
        if let Some(s) = self.sections.get(section) {
            for key in s.keys() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys.sort();
        keys
    }

    fn interpolate(
        &self,
        section: &str,
        key: &str,
        raw: &str,
        depth: usize,
    ) -> Result<String, ConfigError> {
        if depth > MAX_INTERPOLATION_DEPTH {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
                reason: "interpolation nested too deeply".to_string(),
            });
        }

        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(pos) = rest.find('%') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if let Some(after) = tail.strip_prefix("%%") {
                out.push('%');
                rest = after;
            } else if let Some(body) = tail.strip_prefix("%(") {
                let close = body.find(")s").ok_or_else(|| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.to_string(),
                    reason: "unterminated %(...)s reference".to_string(),
                })?;
                let name = &body[..close];
                let referenced = self.raw(section, name).ok_or_else(|| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.to_string(),
                    reason: format!("references undefined option '{}'", name),
                })?;
                out.push_str(&self.interpolate(section, name, referenced, depth + 1)?);
                rest = &body[close + 2..];
            } else {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.to_string(),
                    reason: "'%' must be followed by '%' or '('".to_string(),
                });
            }
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Parse ini text. `origin` labels errors.
pub fn parse_ini(content: &str, origin: &str) -> Result<IniDocument, ConfigError> {
    let mut doc = IniDocument {
        origin: origin.to_string(),
        ..IniDocument::default()
    };
    let mut current: Option<String> = None;
    let mut last_key: Option<String> = None;

    let malformed = |line: usize, reason: &str| ConfigError::Malformed {
        path: origin.to_string(),
        line,
        reason: reason.to_string(),
    };

    for (idx, line) in content.lines().enumerate() {
        let lineno = idx + 1;
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        // Continuation of the previous value
        if line.starts_with(char::is_whitespace) {
            if let (Some(section), Some(key)) = (current.as_ref(), last_key.as_ref()) {
                let target = section_mut(&mut doc, section);
                if let Some(value) = target.get_mut(key) {
                    value.push('\n');
                    value.push_str(trimmed);
                    continue;
                }
            }
            return Err(malformed(lineno, "continuation line without a preceding option"));
        }

        if trimmed.starts_with('[') {
            let name = trimmed
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| malformed(lineno, "invalid section header"))?;
            if name != DEFAULT_SECTION && !doc.sections.contains_key(name) {
                doc.sections.insert(name.to_string(), Section::new());
                doc.order.push(name.to_string());
            }
            current = Some(name.to_string());
            last_key = None;
            continue;
        }

        let section = current
            .as_ref()
            .ok_or_else(|| malformed(lineno, "option outside of any section"))?;

        let split = trimmed
            .find(|c: char| c == '=' || c == ':')
            .ok_or_else(|| malformed(lineno, "expected 'key = value'"))?;
        let key = trimmed[..split].trim().to_lowercase();
        if key.is_empty() {
            return Err(malformed(lineno, "empty option name"));
        }
        let value = trimmed[split + 1..].trim().to_string();

        section_mut(&mut doc, section).insert(key.clone(), value);
        last_key = Some(key);
    }

    Ok(doc)
}

fn section_mut<'a>(doc: &'a mut IniDocument, name: &str) -> &'a mut Section {
    if name == DEFAULT_SECTION {
        &mut doc.defaults
    } else {
        doc.sections.entry(name.to_string()).or_default()
    }
}

/// Load and parse an ini file.
pub fn load_ini(path: &Path) -> Result<IniDocument, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(path.display().to_string())
        } else {
            ConfigError::IoError(e)
        }
    })?;
    parse_ini(&content, &path.display().to_string())
}

/// Load a JSON object file (the engine configuration).
pub fn load_json_object(
    path: &Path,
) -> Result<serde_json::Map<String, serde_json::Value>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(path.display().to_string())
        } else {
            ConfigError::IoError(e)
        }
    })?;

    match serde_json::from_str(&content)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(ConfigError::InvalidValue {
            key: path.display().to_string(),
            value: other.to_string(),
            reason: "expected a JSON object".to_string(),
        }),
    }
}
