use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// How an existing target relates to the source it is expected to link to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// A symlink whose destination is the expected source.
    Ours,
    /// A symlink to some other existing path.
    Elsewhere(PathBuf),
    /// A symlink to something other than the expected source that no longer exists.
    Broken(PathBuf),
    NotSymlink,
    Absent,
}

/// Reads the link at `target` and compares its destination with `expected_source`.
/// Relative destinations are resolved against the link's parent directory and both
/// sides are normalized lexically, so a dangling link to the expected source is
/// still `Ours`.
pub fn link_state(target: &Path, expected_source: &Path) -> io::Result<LinkState> {
    let metadata = match fs::symlink_metadata(target) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LinkState::Absent),
        Err(err) => return Err(err),
    };
    if !metadata.file_type().is_symlink() {
        return Ok(LinkState::NotSymlink);
    }

    let destination = fs::read_link(target)?;
    let destination = if destination.is_relative() {
        target
            .parent()
            .map(|parent| parent.join(&destination))
            .unwrap_or(destination)
    } else {
        destination
    };
    let destination = normalize_path(&destination);

    if destination == normalize_path(expected_source) {
        return Ok(LinkState::Ours);
    }
    if !destination.exists() {
        return Ok(LinkState::Broken(destination));
    }
    Ok(LinkState::Elsewhere(destination))
}

/// Drops `.` components and folds `..` into its parent without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Expands `~` and environment variables in a dotfile target. Relative targets
/// are taken relative to the home directory.
pub fn resolve_target_path(raw: &str) -> PathBuf {
    let expanded = rigger_security::expand_user_path(raw);
    let absolute = if expanded.is_relative() {
        match dirs::home_dir() {
            Some(home) => home.join(expanded),
            None => expanded,
        }
    } else {
        expanded
    };
    normalize_path(&absolute)
}
