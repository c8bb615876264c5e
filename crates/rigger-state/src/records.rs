use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

pub type Details = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    CreatedSymlink,
    RenderedFromTemplate,
    BackupFile,
    DeletedFile,
    InstalledPackage,
    GitCloned,
    UpdatedRepo,
    ExecutedScript,
    SecurityError,
    WouldCreateSymlink,
    WouldRenderTemplate,
    WouldBackupFile,
    WouldDeleteFile,
    WouldInstallPackage,
    WouldCloneRepo,
    WouldPullRepo,
    WouldExecuteScript,
    FailedSymlink,
    FailedRender,
    FailedBackup,
}

impl ChangeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreatedSymlink => "created_symlink",
            Self::RenderedFromTemplate => "rendered_from_template",
            Self::BackupFile => "backup_file",
            Self::DeletedFile => "deleted_file",
            Self::InstalledPackage => "installed_package",
            Self::GitCloned => "git_cloned",
            Self::UpdatedRepo => "updated_repo",
            Self::ExecutedScript => "executed_script",
            Self::SecurityError => "security_error",
            Self::WouldCreateSymlink => "would_create_symlink",
            Self::WouldRenderTemplate => "would_render_template",
            Self::WouldBackupFile => "would_backup_file",
            Self::WouldDeleteFile => "would_delete_file",
            Self::WouldInstallPackage => "would_install_package",
            Self::WouldCloneRepo => "would_clone_repo",
            Self::WouldPullRepo => "would_pull_repo",
            Self::WouldExecuteScript => "would_execute_script",
            Self::FailedSymlink => "failed_symlink",
            Self::FailedRender => "failed_render",
            Self::FailedBackup => "failed_backup",
        }
    }

    /// True for actions that changed the machine and therefore take part in replay.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Self::CreatedSymlink
                | Self::RenderedFromTemplate
                | Self::BackupFile
                | Self::DeletedFile
                | Self::InstalledPackage
                | Self::GitCloned
                | Self::UpdatedRepo
                | Self::ExecutedScript
        )
    }

    pub fn is_dry_run(self) -> bool {
        self.as_str().starts_with("would_")
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    pub action: ChangeAction,
    pub path: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub details: Details,
}

impl ChangeRecord {
    pub fn new(action: ChangeAction, path: impl Into<String>) -> Self {
        Self {
            action,
            path: path.into(),
            timestamp: Utc::now(),
            details: Details::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(serde_json::Value::as_str)
    }

    pub fn status(&self) -> Option<&str> {
        self.detail_str("status")
    }

    pub fn is_failed(&self) -> bool {
        self.status() == Some(STATUS_FAILED)
    }
}
