use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rigger_core::{link_state, LinkState};
use serde::Serialize;
use tracing::{info, warn};

use crate::{ChangeAction, ChangeRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOutcome {
    Undone,
    SkippedAlreadyAbsent,
    ManualActionRequired(String),
    Error(String),
}

impl UndoOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Undone => "undone",
            Self::SkippedAlreadyAbsent => "skipped_already_absent",
            Self::ManualActionRequired(_) => "manual_action_required",
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Display for UndoOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(reason) => write!(f, "error:{reason}"),
            other => f.write_str(other.label()),
        }
    }
}

impl Serialize for UndoOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UndoEntry {
    pub action: ChangeAction,
    pub path: String,
    pub outcome: UndoOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UndoReport {
    pub entries: Vec<UndoEntry>,
}

impl UndoReport {
    pub fn count(&self, label: &str) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.outcome.label() == label)
            .count()
    }

    pub fn undone(&self) -> usize {
        self.count("undone")
    }

    pub fn manual_actions(&self) -> impl Iterator<Item = &UndoEntry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.outcome, UndoOutcome::ManualActionRequired(_)))
    }

    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| matches!(entry.outcome, UndoOutcome::Error(_)))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Undoes `records` newest first. A failure on one record is reported and the
/// walk continues. Records that did not change the machine are left out.
pub fn replay_records(records: &[ChangeRecord]) -> UndoReport {
    let mut report = UndoReport::default();
    for record in records.iter().rev() {
        if !record.action.is_mutation() || record.is_failed() {
            continue;
        }
        let outcome = undo_record(record);
        match &outcome {
            UndoOutcome::Error(reason) => {
                warn!(action = %record.action, path = %record.path, reason = %reason, "undo failed");
            }
            UndoOutcome::ManualActionRequired(hint) => {
                warn!(action = %record.action, path = %record.path, hint = %hint, "manual action required");
            }
            _ => info!(action = %record.action, path = %record.path, outcome = %outcome, "undo"),
        }
        report.entries.push(UndoEntry {
            action: record.action,
            path: record.path.clone(),
            outcome,
        });
    }
    report
}

fn undo_record(record: &ChangeRecord) -> UndoOutcome {
    let path = Path::new(&record.path);
    match record.action {
        ChangeAction::CreatedSymlink => undo_symlink(record, path),
        ChangeAction::RenderedFromTemplate => match backup_of(record) {
            Some(backup) if backup_exists(&backup) => restore_backup(&backup, path, true),
            _ => UndoOutcome::ManualActionRequired(format!(
                "no backup recorded; rendered file left in place at {}",
                path.display()
            )),
        },
        ChangeAction::BackupFile => match backup_of(record) {
            Some(backup) if backup_exists(&backup) => restore_backup(&backup, path, false),
            Some(_) => UndoOutcome::SkippedAlreadyAbsent,
            None => UndoOutcome::Error("backup record has no backup_path".to_string()),
        },
        ChangeAction::GitCloned => match fs::symlink_metadata(path) {
            Ok(_) => match fs::remove_dir_all(path) {
                Ok(()) => UndoOutcome::Undone,
                Err(err) => UndoOutcome::Error(format!("failed to remove clone: {err}")),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                UndoOutcome::SkippedAlreadyAbsent
            }
            Err(err) => UndoOutcome::Error(err.to_string()),
        },
        ChangeAction::InstalledPackage => UndoOutcome::ManualActionRequired(format!(
            "package '{}' stays installed; remove it with the system package manager if unwanted",
            record.path
        )),
        ChangeAction::ExecutedScript => UndoOutcome::ManualActionRequired(format!(
            "script '{}' cannot be reverted automatically",
            record.path
        )),
        ChangeAction::UpdatedRepo => {
            let hint = match record.detail_str("previous_head") {
                Some(head) => format!("run 'git -C {} reset --hard {head}' to revert", record.path),
                None => "repository pull cannot be reverted automatically".to_string(),
            };
            UndoOutcome::ManualActionRequired(hint)
        }
        ChangeAction::DeletedFile => UndoOutcome::ManualActionRequired(format!(
            "{} was deleted in force mode; restore it from a snapshot",
            record.path
        )),
        _ => UndoOutcome::SkippedAlreadyAbsent,
    }
}

fn undo_symlink(record: &ChangeRecord, path: &Path) -> UndoOutcome {
    let Some(source) = record.detail_str("source") else {
        return UndoOutcome::ManualActionRequired("symlink record has no source".to_string());
    };
    match link_state(path, Path::new(source)) {
        Ok(LinkState::Ours) => match fs::remove_file(path) {
            Ok(()) => UndoOutcome::Undone,
            Err(err) => UndoOutcome::Error(format!("failed to remove symlink: {err}")),
        },
        Ok(LinkState::Absent) => UndoOutcome::SkippedAlreadyAbsent,
        Ok(_) => UndoOutcome::ManualActionRequired(format!(
            "{} no longer links to {source}; left untouched",
            path.display()
        )),
        Err(err) => UndoOutcome::Error(err.to_string()),
    }
}

fn backup_of(record: &ChangeRecord) -> Option<PathBuf> {
    record.detail_str("backup_path").map(PathBuf::from)
}

fn backup_exists(backup: &Path) -> bool {
    fs::symlink_metadata(backup).is_ok()
}

fn restore_backup(backup: &Path, target: &Path, replace_current: bool) -> UndoOutcome {
    match fs::symlink_metadata(target) {
        Ok(metadata) if replace_current && !metadata.is_dir() => {
            if let Err(err) = fs::remove_file(target) {
                return UndoOutcome::Error(format!("failed to remove {}: {err}", target.display()));
            }
        }
        Ok(_) => {
            return UndoOutcome::ManualActionRequired(format!(
                "{} is occupied; backup kept at {}",
                target.display(),
                backup.display()
            ));
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return UndoOutcome::Error(err.to_string()),
    }

    match fs::rename(backup, target) {
        Ok(()) => UndoOutcome::Undone,
        Err(err) => UndoOutcome::Error(format!(
            "failed to restore {} from {}: {err}",
            target.display(),
            backup.display()
        )),
    }
}
