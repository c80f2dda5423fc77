//! Kickstart flattening and placeholder substitution.
//!
//! The kickstart is first flattened (includes and macros expanded) by an
//! external tool for a platform variant, then every `@KEY@` placeholder is
//! replaced from a [`SubstitutionMap`]. Any placeholder still present after
//! substitution is an error: a leaked `@OSTREE_*@` token would end up inside
//! the install script.

use crate::error::{ConfigError, TemplateError};
use crate::models::SubstitutionMap;
use crate::orchestrator::executor::{run_command, RunOptions};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Command;

static PLACEHOLDER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@([A-Z][A-Z0-9_]*)@").expect("Invalid placeholder regex")
});

/// Placeholder carrying the content server port.
pub const OSTREE_PORT: &str = "OSTREE_PORT";
/// Placeholder carrying the ref being composed.
pub const OSTREE_REF: &str = "OSTREE_REF";
/// Placeholder carrying the OS name of the deployment.
pub const OSTREE_OSNAME: &str = "OSTREE_OSNAME";

/// One kickstart-name pattern and the flattening version it selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantRule {
    pub pattern: String,
    pub version: String,
}

/// Ordered mapping from kickstart file names to flattening versions.
///
/// The first rule whose pattern occurs in the kickstart basename wins;
/// otherwise the default applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantProfiles {
    rules: Vec<VariantRule>,
    default: String,
}

impl Default for VariantProfiles {
    fn default() -> Self {
        VariantProfiles {
            rules: vec![VariantRule {
                pattern: "fedora".to_string(),
                version: "F21".to_string(),
            }],
            default: "RHEL7".to_string(),
        }
    }
}

impl VariantProfiles {
    pub fn new(rules: Vec<VariantRule>, default: impl Into<String>) -> Self {
        VariantProfiles {
            rules,
            default: default.into(),
        }
    }

    /// Parse `pattern=VERSION, ..., *=DEFAULT`. Entries may be separated by
    /// commas or newlines. Without a `*` entry the built-in default is kept.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut rules = Vec::new();
        let mut default = VariantProfiles::default().default;

        for entry in spec.split(|c| c == ',' || c == '\n') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (pattern, version) = entry
                .split_once('=')
                .map(|(p, v)| (p.trim(), v.trim()))
                .filter(|(p, v)| !p.is_empty() && !v.is_empty())
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "kickstart_versions".to_string(),
                    value: entry.to_string(),
                    reason: "expected pattern=VERSION".to_string(),
                })?;
            if pattern == "*" {
                default = version.to_string();
            } else {
                rules.push(VariantRule {
                    pattern: pattern.to_string(),
                    version: version.to_string(),
                });
            }
        }

        Ok(VariantProfiles { rules, default })
    }

    /// Flattening version for a kickstart path.
    pub fn select(&self, kickstart: &Path) -> &str {
        let basename = kickstart
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.rules
            .iter()
            .find(|rule| basename.contains(&rule.pattern))
            .map(|rule| rule.version.as_str())
            .unwrap_or(&self.default)
    }
}

impl fmt::Display for VariantProfiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rule in &self.rules {
            write!(f, "{}={}, ", rule.pattern, rule.version)?;
        }
        write!(f, "*={}", self.default)
    }
}

/// External kickstart flattening tool.
pub trait KickstartFlattener: Send + Sync {
    /// Flatten `kickstart` for `version` into `output`.
    fn flatten<'a>(
        &'a self,
        kickstart: &'a Path,
        version: &'a str,
        output: &'a Path,
    ) -> BoxFuture<'a, Result<(), TemplateError>>;
}

/// `ksflatten` from pykickstart.
#[derive(Debug, Clone, Default)]
pub struct Ksflatten;

impl KickstartFlattener for Ksflatten {
    fn flatten<'a>(
        &'a self,
        kickstart: &'a Path,
        version: &'a str,
        output: &'a Path,
    ) -> BoxFuture<'a, Result<(), TemplateError>> {
        Box::pin(async move {
            let mut cmd = Command::new("ksflatten");
            cmd.arg("--version")
                .arg(version)
                .arg("-c")
                .arg(kickstart)
                .arg("-o")
                .arg(output);

            let result = run_command(cmd, RunOptions::default())
                .await
                .map_err(|e| TemplateError::FlattenFailed(e.to_string()))?;
            if !result.status.success() {
                return Err(TemplateError::FlattenFailed(format!(
                    "ksflatten exited with {}: {}",
                    result.status,
                    result.stderr.join("\n")
                )));
            }
            Ok(())
        })
    }
}

/// Kickstart flattening plus substitution.
pub struct TemplateResolver {
    profiles: VariantProfiles,
    flattener: Box<dyn KickstartFlattener>,
}

impl TemplateResolver {
    pub fn new(profiles: VariantProfiles, flattener: Box<dyn KickstartFlattener>) -> Self {
        TemplateResolver {
            profiles,
            flattener,
        }
    }

    pub fn profiles(&self) -> &VariantProfiles {
        &self.profiles
    }

    /// Flatten `kickstart` into `workdir` and return the flattened text.
    pub async fn flatten(&self, kickstart: &Path, workdir: &Path) -> Result<String, TemplateError> {
        if !kickstart.is_file() {
            return Err(TemplateError::Unreadable {
                path: kickstart.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }

        let version = self.profiles.select(kickstart);
        let output = flattened_path(kickstart, workdir);
        log::info!(
            "[Template] Flattening {} (version {})",
            kickstart.display(),
            version
        );

        self.flattener.flatten(kickstart, version, &output).await?;

        tokio::fs::read_to_string(&output)
            .await
            .map_err(|source| TemplateError::Unreadable {
                path: output.clone(),
                source,
            })
    }
}

fn flattened_path(kickstart: &Path, workdir: &Path) -> PathBuf {
    let basename = kickstart
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "kickstart.ks".into());
    workdir.join(basename)
}

/// Replace every `@KEY@` whose key is in `map`, in a single pass.
///
/// Fails with the full list of keys left unresolved.
pub fn substitute(text: &str, map: &SubstitutionMap) -> Result<String, TemplateError> {
    let mut unresolved: Vec<String> = Vec::new();

    let rendered = PLACEHOLDER_REGEX.replace_all(text, |caps: &Captures| {
        let key = &caps[1];
        match map.get(key) {
            Some(value) => value.to_string(),
            None => {
                if !unresolved.iter().any(|k| k == key) {
                    unresolved.push(key.to_string());
                }
                caps[0].to_string()
            }
        }
    });

    if !unresolved.is_empty() {
        return Err(TemplateError::UnresolvedPlaceholders(unresolved));
    }
    Ok(rendered.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn ostree_map() -> SubstitutionMap {
        let mut map = SubstitutionMap::new();
        map.insert(OSTREE_PORT, "8080");
        map.insert(OSTREE_REF, "fedora-atomic/rawhide/x86_64/docker-host");
        map.insert(OSTREE_OSNAME, "fedora-atomic");
        map
    }

    #[test]
    fn test_substitute_all_occurrences() {
        let ks = "ostreesetup --osname=@OSTREE_OSNAME@ --url=http://192.168.122.1:@OSTREE_PORT@/ \
                  --ref=@OSTREE_REF@\n# again @OSTREE_PORT@\n";
        let out = substitute(ks, &ostree_map()).unwrap();
        assert!(out.contains("--osname=fedora-atomic"));
        assert!(out.contains(":8080/"));
        assert!(out.contains("# again 8080"));
        assert!(!out.contains('@'));
    }

    #[test]
    fn test_unresolved_placeholder_is_error() {
        let ks = "url @OSTREE_PORT@ @OSTREE_REMOTE@ @OSTREE_REMOTE@ @OTHER_KEY@";
        match substitute(ks, &ostree_map()) {
            Err(TemplateError::UnresolvedPlaceholders(keys)) => {
                assert_eq!(keys, vec!["OSTREE_REMOTE".to_string(), "OTHER_KEY".to_string()]);
            }
            other => panic!("expected unresolved placeholders, got {:?}", other),
        }
    }

    #[test]
    fn test_package_groups_are_not_placeholders() {
        let ks = "%packages\n@core\n@standard\n%end\nrootpw --lock\nuser root@localhost\n";
        assert_eq!(substitute(ks, &ostree_map()).unwrap(), ks);
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let mut map = SubstitutionMap::new();
        map.insert("A", "@B@");
        map.insert("B", "x");
        assert_eq!(substitute("@A@", &map).unwrap(), "@B@");
    }

    #[test]
    fn test_variant_selection_default_table() {
        let profiles = VariantProfiles::default();
        assert_eq!(profiles.select(Path::new("/ks/fedora-atomic.ks")), "F21");
        assert_eq!(profiles.select(Path::new("/ks/centos-atomic.ks")), "RHEL7");
    }

    #[test]
    fn test_variant_selection_uses_basename_only() {
        let profiles = VariantProfiles::default();
        assert_eq!(profiles.select(Path::new("/home/fedora/centos.ks")), "RHEL7");
    }

    #[test]
    fn test_variant_parse_ordered_rules() {
        let profiles = VariantProfiles::parse("fedora-23=F23, fedora=F21\n*=RHEL7").unwrap();
        assert_eq!(profiles.select(Path::new("fedora-23-atomic.ks")), "F23");
        assert_eq!(profiles.select(Path::new("fedora-atomic.ks")), "F21");
        assert_eq!(profiles.select(Path::new("rhel.ks")), "RHEL7");
        assert_eq!(profiles.to_string(), "fedora-23=F23, fedora=F21, *=RHEL7");
    }

    #[test]
    fn test_variant_parse_rejects_garbage() {
        assert!(VariantProfiles::parse("fedora").is_err());
        assert!(VariantProfiles::parse("=F21").is_err());
    }

    struct CopyFlattener {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl KickstartFlattener for CopyFlattener {
        fn flatten<'a>(
            &'a self,
            kickstart: &'a Path,
            version: &'a str,
            output: &'a Path,
        ) -> BoxFuture<'a, Result<(), TemplateError>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(version.to_string());
                std::fs::copy(kickstart, output).map_err(|source| TemplateError::Unreadable {
                    path: kickstart.to_path_buf(),
                    source,
                })?;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_flatten_writes_into_workdir() {
        let src = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let ks = src.path().join("fedora-atomic.ks");
        std::fs::write(&ks, "ostreesetup --ref=@OSTREE_REF@\n").unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let resolver = TemplateResolver::new(
            VariantProfiles::default(),
            Box::new(CopyFlattener { calls: calls.clone() }),
        );
        let text = resolver.flatten(&ks, work.path()).await.unwrap();

        assert_eq!(text, "ostreesetup --ref=@OSTREE_REF@\n");
        assert!(work.path().join("fedora-atomic.ks").exists());
        assert_eq!(calls.lock().unwrap().as_slice(), &["F21".to_string()]);
    }

    #[tokio::test]
    async fn test_flatten_missing_kickstart() {
        let work = TempDir::new().unwrap();
        let resolver = TemplateResolver::new(
            VariantProfiles::default(),
            Box::new(CopyFlattener {
                calls: Arc::new(Mutex::new(Vec::new())),
            }),
        );
        let result = resolver.flatten(Path::new("/nonexistent/a.ks"), work.path()).await;
        assert!(matches!(result, Err(TemplateError::Unreadable { .. })));
    }

    proptest! {
        #[test]
        fn prop_substitution_is_idempotent(
            prefix in "[a-z @\n]{0,40}",
            suffix in "[a-z @\n]{0,40}",
            port in 1024u16..65535,
        ) {
            let mut map = ostree_map();
            map.insert(OSTREE_PORT, port.to_string());
            let text = format!("{}@OSTREE_PORT@{}@OSTREE_REF@", prefix, suffix);
            let first = substitute(&text, &map).unwrap();
            let second = substitute(&text, &map).unwrap();
            prop_assert_eq!(first.as_bytes(), second.as_bytes());
            prop_assert!(!first.contains("@OSTREE_"));
        }
    }
}
