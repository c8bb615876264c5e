use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::expand::expand_user_path;

const RESTRICTED_DIRS: &[&str] = &[
    "/etc", "/root", "/boot", "/sys", "/proc", "/dev", "/var/log", "/usr/bin", "/usr/sbin",
    "/bin", "/sbin",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathVerdict {
    Ok,
    Traversal,
    Restricted(&'static str),
}

impl PathVerdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Ok => None,
            Self::Traversal => Some("path_traversal".to_string()),
            Self::Restricted(dir) => Some(format!("restricted_path:{dir}")),
        }
    }
}

impl fmt::Display for PathVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Traversal => f.write_str("path traversal"),
            Self::Restricted(dir) => write!(f, "path under restricted directory {dir}"),
        }
    }
}

pub fn has_traversal(raw: &str) -> bool {
    raw.contains("../")
        || raw.contains("..\\")
        || Path::new(raw)
            .components()
            .any(|component| component == Component::ParentDir)
}

pub fn validate_path(raw: &str) -> PathVerdict {
    if has_traversal(raw) {
        return PathVerdict::Traversal;
    }

    let expanded = expand_user_path(raw);
    if !expanded.is_absolute() {
        return PathVerdict::Ok;
    }
    // an environment variable may smuggle a parent component back in
    if has_traversal(&expanded.to_string_lossy()) {
        return PathVerdict::Traversal;
    }

    let lexical = lexical_normalize(&expanded);
    if let Some(dir) = restricted_root(&lexical) {
        return PathVerdict::Restricted(dir);
    }
    if let Ok(resolved) = lexical.canonicalize() {
        if let Some(dir) = restricted_root(&resolved) {
            return PathVerdict::Restricted(dir);
        }
    }
    PathVerdict::Ok
}

/// Checks a name meant for use inside a snapshot archive.
pub fn validate_archive_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("archive name must not be empty".to_string());
    }
    if name.contains("..") {
        return Err(format!("archive name contains '..': {name}"));
    }
    if name.starts_with('/') || name.starts_with('\\') {
        return Err(format!("archive name is absolute: {name}"));
    }
    if name.contains(':') {
        return Err(format!("archive name contains a drive separator: {name}"));
    }
    Ok(())
}

fn restricted_root(path: &Path) -> Option<&'static str> {
    RESTRICTED_DIRS.iter().copied().find(|dir| {
        let dir = Path::new(dir);
        path.starts_with(dir) && path != dir
    })
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
