//! Templating phase: everything the base build needs as input.
//!
//! - the kickstart, flattened for its variant and rendered against the
//!   content server port, ref and OS name
//! - the engine override map
//! - the TDL template text

use crate::config::OverrideMap;
use crate::error::TemplateError;
use crate::models::{ParameterBag, RepoSource, SubstitutionMap};
use crate::template::{substitute, TemplateResolver, OSTREE_OSNAME, OSTREE_PORT, OSTREE_REF};
use std::path::Path;

/// Placeholder values for one served repository.
pub fn substitution_map(source: &RepoSource, port: u16) -> SubstitutionMap {
    let mut map = SubstitutionMap::new();
    map.insert(OSTREE_PORT, port.to_string());
    map.insert(OSTREE_REF, source.ostree_ref.clone());
    map.insert(OSTREE_OSNAME, source.os_name.clone());
    map
}

/// Flatten and render the kickstart.
pub async fn render_kickstart(
    resolver: &TemplateResolver,
    kickstart: &Path,
    workdir: &Path,
    map: &SubstitutionMap,
) -> Result<String, TemplateError> {
    let flattened = resolver.flatten(kickstart, workdir).await?;
    let rendered = substitute(&flattened, map)?;
    log::debug!(
        "[Template] Rendered kickstart: {} bytes, {} placeholders",
        rendered.len(),
        map.len()
    );
    Ok(rendered)
}

/// Parameters for the base build.
pub fn assemble_parameters(install_script: String, overrides: &OverrideMap) -> ParameterBag {
    let mut bag = ParameterBag::new();
    bag.insert("install_script".to_string(), install_script.into());
    bag.insert("generate_icicle".to_string(), false.into());
    bag.insert("oz_overrides".to_string(), overrides.to_json().into());
    bag
}

pub async fn read_template(path: &Path) -> Result<String, TemplateError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| TemplateError::Unreadable {
            path: path.to_path_buf(),
            source,
        })
}
