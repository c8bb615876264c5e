use std::path::Path;

use rigger_security::validate_archive_name;
use serde::{Deserialize, Serialize};

pub const MANIFEST_ENTRY: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotManifest {
    pub config_name: String,
    pub timestamp: String,
    pub backup_type: String,
    #[serde(default)]
    pub dotfiles: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub source: String,
    pub target: String,
    pub exists: bool,
    pub is_symlink: bool,
    pub original_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// The name a target is stored under: its absolute path without the leading separator.
pub fn archive_name_for(target: &Path) -> Result<String, String> {
    let raw = target.to_string_lossy().replace('\\', "/");
    let name = raw.trim_start_matches('/').trim_end_matches('/').to_string();
    validate_archive_name(&name)?;
    Ok(name)
}
