use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use rigger_core::sanitize_name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rollback_root(&self) -> PathBuf {
        self.root.join("rollback")
    }

    pub fn rollback_dir(&self, spec_name: &str) -> PathBuf {
        self.rollback_root().join(sanitize_name(spec_name))
    }

    pub fn rollback_file_prefix(&self, spec_name: &str, operation: &str) -> String {
        format!(
            "{}_rollback_{}_",
            sanitize_name(spec_name),
            sanitize_name(operation)
        )
    }

    pub fn transient_state_path(&self, spec_name: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_name(spec_name)))
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn lock_path(&self, spec_name: &str) -> PathBuf {
        self.locks_dir()
            .join(format!("{}.lock", sanitize_name(spec_name)))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.root.clone(), self.rollback_root(), self.locks_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
