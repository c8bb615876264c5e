use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("corrupt snapshot archive {}: {reason}", .path.display())]
    CorruptArchive { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}
