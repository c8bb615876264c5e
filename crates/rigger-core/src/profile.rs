use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rigger_security::expand_env_vars;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::{EffectiveSpecification, SpecError, Specification};

/// Supplies the profile name when the caller does not pass one explicitly.
pub trait ProfileDetector {
    fn detect(&self) -> String;
}

/// Names the current host as `{os}-{arch}` with an optional machine kind suffix.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProfileDetector;

impl ProfileDetector for HostProfileDetector {
    fn detect(&self) -> String {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let mut parts = vec![os.to_string(), std::env::consts::ARCH.to_string()];

        let hostname = host_name().to_lowercase();
        if hostname.contains("laptop") || hostname.contains("thinkpad") {
            parts.push("laptop".to_string());
        } else if hostname.contains("desktop") || hostname.contains("tower") {
            parts.push("desktop".to_string());
        } else if running_under_wsl() {
            parts.push("wsl".to_string());
        } else if running_in_docker() {
            parts.push("docker".to_string());
        }

        parts.join("-")
    }
}

#[derive(Debug, Clone)]
pub struct FixedProfileDetector(pub String);

impl ProfileDetector for FixedProfileDetector {
    fn detect(&self) -> String {
        self.0.clone()
    }
}

fn host_name() -> String {
    for var in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                return value.trim().to_string();
            }
        }
    }
    fs::read_to_string("/etc/hostname")
        .map(|raw| raw.trim().to_string())
        .unwrap_or_default()
}

fn running_under_wsl() -> bool {
    fs::read_to_string("/proc/version")
        .map(|raw| raw.to_lowercase().contains("microsoft"))
        .unwrap_or(false)
}

fn running_in_docker() -> bool {
    Path::new("/.dockerenv").exists()
        || fs::read_to_string("/proc/1/cgroup")
            .map(|raw| raw.contains("docker"))
            .unwrap_or(false)
}

pub fn profile_document_path(base: &Path, profile: &str) -> PathBuf {
    sibling_document(base, &format!("-{profile}"))
}

pub fn local_document_path(base: &Path) -> PathBuf {
    sibling_document(base, ".local")
}

fn sibling_document(base: &Path, suffix: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = base
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_else(|| "yaml".to_string());
    base.with_file_name(format!("{stem}{suffix}.{ext}"))
}

/// Loads `path`, then its profile and local override documents, then the inline
/// `profiles[profile]` section. Later sources override earlier ones key by key.
pub fn load_specification(
    path: &Path,
    profile: Option<&str>,
    detector: &dyn ProfileDetector,
) -> Result<EffectiveSpecification, SpecError> {
    let profile = match profile {
        Some(profile) => profile.to_string(),
        None => detector.detect(),
    };

    let mut merged = match read_document(path)? {
        Some(document) => document,
        None => return Err(SpecError::NotFound(path.to_path_buf())),
    };

    let mut layers = vec![path.to_path_buf()];
    for overlay_path in [profile_document_path(path, &profile), local_document_path(path)] {
        if let Some(document) = read_document(&overlay_path)? {
            deep_merge(&mut merged, document);
            layers.push(overlay_path);
        }
    }

    let inline = merged
        .get("profiles")
        .and_then(|profiles| profiles.get(profile.as_str()))
        .cloned();
    if let Some(overlay) = inline {
        if overlay.is_mapping() {
            deep_merge(&mut merged, overlay);
            debug!(profile = %profile, "applied inline profile overlay");
        }
    }
    debug!(profile = %profile, layers = layers.len(), "resolved specification layers");

    let spec: Specification =
        serde_yaml::from_value(merged).map_err(|err| SpecError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    spec.validate()?;

    let source_path = absolute(path);
    let base_dir = source_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let base_dir = fs::canonicalize(&base_dir).unwrap_or(base_dir);

    Ok(EffectiveSpecification {
        spec,
        source_path,
        base_dir,
        profile,
    })
}

fn read_document(path: &Path) -> Result<Option<Value>, SpecError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SpecError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let expanded = expand_env_vars(&raw);
    let value: Value = serde_yaml::from_str(&expanded).map_err(|err| SpecError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    match value {
        Value::Null => Ok(Some(Value::Mapping(Mapping::new()))),
        Value::Mapping(_) => Ok(Some(value)),
        _ => Err(SpecError::Parse {
            path: path.to_path_buf(),
            message: "document root must be a mapping".to_string(),
        }),
    }
}

/// Mappings merge recursively; every other value in `overlay` replaces the base value.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                let nested =
                    value.is_mapping() && base_map.get(&key).is_some_and(Value::is_mapping);
                if !nested {
                    base_map.insert(key, value);
                } else if let Some(existing) = base_map.get_mut(&key) {
                    deep_merge(existing, value);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
