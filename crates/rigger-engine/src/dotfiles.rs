use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rigger_core::{link_state, normalize_path, resolve_target_path, Dotfile, LinkState};
use rigger_security::{expand_user_path, validate_path, PathVerdict};
use rigger_state::{ChangeAction, ChangeRecord, OperationTracker};
use tracing::{debug, info, warn};

use crate::outcome::{journal, ItemOutcome, ProgressSink, RunOptions};
use crate::template::TemplateRenderer;

pub const DOTFILES_STAGE: &str = "dotfiles";
pub const DEFAULT_TEMPLATE_EXTENSION: &str = ".j2";

/// Links or renders dotfiles from the specification directory into place.
pub struct DotfileService<'a> {
    renderer: &'a dyn TemplateRenderer,
    variables: &'a BTreeMap<String, serde_yaml::Value>,
    base_dir: PathBuf,
    template_extension: String,
}

impl<'a> DotfileService<'a> {
    pub fn new(
        renderer: &'a dyn TemplateRenderer,
        base_dir: &Path,
        variables: &'a BTreeMap<String, serde_yaml::Value>,
    ) -> Self {
        Self {
            renderer,
            variables,
            base_dir: base_dir.to_path_buf(),
            template_extension: DEFAULT_TEMPLATE_EXTENSION.to_string(),
        }
    }

    pub fn with_template_extension(mut self, extension: impl Into<String>) -> Self {
        self.template_extension = extension.into();
        self
    }

    pub fn reconcile(
        &self,
        dotfiles: &[Dotfile],
        mut tracker: Option<&mut OperationTracker>,
        options: &RunOptions,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<ItemOutcome>> {
        progress.stage_started(DOTFILES_STAGE, dotfiles.len());
        let mut outcomes = Vec::with_capacity(dotfiles.len());
        for dotfile in dotfiles {
            let outcome = self.reconcile_one(dotfile, &mut tracker, options);
            progress.item_finished(DOTFILES_STAGE, &outcome);
            outcomes.push(outcome);
        }
        progress.stage_finished(DOTFILES_STAGE);
        Ok(outcomes)
    }

    pub fn resolve_source(&self, raw: &str) -> Option<PathBuf> {
        resolve_source(&self.base_dir, raw)
    }

    pub fn is_template(&self, source: &Path) -> bool {
        source
            .file_name()
            .map(|name| name.to_string_lossy().ends_with(&self.template_extension))
            .unwrap_or(false)
    }

    pub fn render_source(&self, source: &Path) -> Result<String> {
        let template = fs::read_to_string(source)
            .with_context(|| format!("failed to read template {}", source.display()))?;
        self.renderer
            .render(&template, self.variables)
            .with_context(|| format!("failed to render template {}", source.display()))
    }

    fn reconcile_one(
        &self,
        dotfile: &Dotfile,
        tracker: &mut Option<&mut OperationTracker>,
        options: &RunOptions,
    ) -> ItemOutcome {
        let target = match resolve_target(&dotfile.target) {
            Ok(target) => target,
            Err(verdict) => {
                warn!(target = %dotfile.target, %verdict, "refusing dotfile target");
                journal(
                    tracker,
                    ChangeRecord::new(ChangeAction::SecurityError, dotfile.target.as_str())
                        .with_detail("error", verdict.reason().unwrap_or_default())
                        .with_detail("source", dotfile.source.as_str()),
                );
                return ItemOutcome::failed(&dotfile.target, verdict.to_string());
            }
        };
        let Some(source) = self.resolve_source(&dotfile.source) else {
            warn!(source = %dotfile.source, "dotfile source escapes the configuration directory");
            journal(
                tracker,
                ChangeRecord::new(ChangeAction::SecurityError, dotfile.target.as_str())
                    .with_detail("error", "source_outside_config")
                    .with_detail("source", dotfile.source.as_str()),
            );
            return ItemOutcome::failed(
                &dotfile.target,
                "source escapes the configuration directory",
            );
        };

        let shown = target.display().to_string();
        let template = self.is_template(&source);
        let failure_action = if template {
            ChangeAction::FailedRender
        } else {
            ChangeAction::FailedSymlink
        };

        if fs::symlink_metadata(&source).is_err() {
            return record_failure(
                tracker,
                failure_action,
                &shown,
                &source,
                format!("source {} does not exist", source.display()),
            );
        }

        let rendered = if template {
            match self.render_source(&source) {
                Ok(content) => Some(content),
                Err(err) => {
                    return record_failure(
                        tracker,
                        failure_action,
                        &shown,
                        &source,
                        format!("{err:#}"),
                    );
                }
            }
        } else {
            None
        };

        match (&rendered, link_state(&target, &source)) {
            (None, Ok(LinkState::Ours)) => {
                debug!(target = %shown, "already linked");
                return ItemOutcome::skipped(shown.as_str(), "already linked");
            }
            (Some(content), Ok(LinkState::NotSymlink)) if file_matches(&target, content) => {
                debug!(target = %shown, "already rendered");
                return ItemOutcome::skipped(shown.as_str(), "already rendered");
            }
            (_, Err(err)) => {
                return record_failure(
                    tracker,
                    failure_action,
                    &shown,
                    &source,
                    format!("failed to inspect {shown}: {err}"),
                );
            }
            _ => {}
        }

        let existing = fs::symlink_metadata(&target).ok();

        if options.dry_run {
            if let Some(metadata) = &existing {
                let action = if options.force {
                    ChangeAction::WouldDeleteFile
                } else {
                    ChangeAction::WouldBackupFile
                };
                journal(
                    tracker,
                    ChangeRecord::new(action, shown.as_str())
                        .with_detail("is_symlink", metadata.file_type().is_symlink()),
                );
            }
            let (action, detail) = if template {
                (ChangeAction::WouldRenderTemplate, "would render")
            } else {
                (ChangeAction::WouldCreateSymlink, "would link")
            };
            journal(
                tracker,
                ChangeRecord::new(action, shown.as_str())
                    .with_detail("source", source.display().to_string()),
            );
            return ItemOutcome::applied(shown.as_str(), detail);
        }

        let mut backup_path = None;
        if let Some(metadata) = existing {
            let is_symlink = metadata.file_type().is_symlink();
            if options.force {
                if let Err(err) = remove_existing(&target, &metadata) {
                    return fail_backup(tracker, &shown, err);
                }
                info!(target = %shown, "deleted existing target");
                journal(
                    tracker,
                    ChangeRecord::new(ChangeAction::DeletedFile, shown.as_str())
                        .with_detail("is_symlink", is_symlink)
                        .with_detail("was_directory", metadata.is_dir()),
                );
            } else {
                let backup = match move_aside(&target) {
                    Ok(backup) => backup,
                    Err(err) => return fail_backup(tracker, &shown, err),
                };
                info!(target = %shown, backup = %backup.display(), "backed up existing target");
                journal(
                    tracker,
                    ChangeRecord::new(ChangeAction::BackupFile, shown.as_str())
                        .with_detail("backup_path", backup.display().to_string())
                        .with_detail("exists", true)
                        .with_detail("is_symlink", is_symlink)
                        .with_detail("original_path", shown.as_str()),
                );
                backup_path = Some(backup);
            }
        }

        if let Some(parent) = target.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                return record_failure(
                    tracker,
                    failure_action,
                    &shown,
                    &source,
                    format!("failed to create {}: {err}", parent.display()),
                );
            }
        }

        let (action, written, detail) = match rendered {
            Some(content) => (
                ChangeAction::RenderedFromTemplate,
                fs::write(&target, content),
                "rendered",
            ),
            None => (
                ChangeAction::CreatedSymlink,
                create_symlink(&source, &target),
                "linked",
            ),
        };
        if let Err(err) = written {
            return record_failure(
                tracker,
                failure_action,
                &shown,
                &source,
                format!("failed to write {shown}: {err}"),
            );
        }

        info!(target = %shown, source = %source.display(), action = %action, "placed dotfile");
        let mut record = ChangeRecord::new(action, shown.as_str())
            .with_detail("source", source.display().to_string());
        if let Some(backup) = &backup_path {
            record = record.with_detail("backup_path", backup.display().to_string());
        }
        journal(tracker, record);
        ItemOutcome::applied(shown, detail)
    }
}

/// Resolves `raw` against the specification directory. The result must stay
/// inside that directory, both lexically and once links are followed.
pub fn resolve_source(base_dir: &Path, raw: &str) -> Option<PathBuf> {
    let base_dir = fs::canonicalize(base_dir).unwrap_or_else(|_| normalize_path(base_dir));
    let expanded = expand_user_path(raw);
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    };
    let source = normalize_path(&joined);
    if !source.starts_with(&base_dir) {
        return None;
    }
    match fs::canonicalize(&source) {
        Ok(resolved) if !resolved.starts_with(&base_dir) => None,
        _ => Some(source),
    }
}

/// Validates the raw target and its resolved form, returning the resolved path.
pub fn resolve_target(raw: &str) -> Result<PathBuf, PathVerdict> {
    let verdict = validate_path(raw);
    if !verdict.is_ok() {
        return Err(verdict);
    }
    let target = resolve_target_path(raw);
    match validate_path(&target.to_string_lossy()) {
        PathVerdict::Ok => Ok(target),
        verdict => Err(verdict),
    }
}

fn record_failure(
    tracker: &mut Option<&mut OperationTracker>,
    action: ChangeAction,
    shown: &str,
    source: &Path,
    error: String,
) -> ItemOutcome {
    warn!(target = %shown, error = %error, "dotfile failed");
    journal(
        tracker,
        ChangeRecord::new(action, shown)
            .with_detail("source", source.display().to_string())
            .with_detail("error", error.as_str()),
    );
    ItemOutcome::failed(shown, error)
}

fn fail_backup(
    tracker: &mut Option<&mut OperationTracker>,
    shown: &str,
    err: io::Error,
) -> ItemOutcome {
    warn!(target = %shown, error = %err, "could not move existing target aside");
    journal(
        tracker,
        ChangeRecord::new(ChangeAction::FailedBackup, shown).with_detail("error", err.to_string()),
    );
    ItemOutcome::failed(shown, format!("failed to back up existing target: {err}"))
}

fn file_matches(path: &Path, content: &str) -> bool {
    fs::read_to_string(path)
        .map(|existing| existing == content)
        .unwrap_or(false)
}

fn remove_existing(target: &Path, metadata: &fs::Metadata) -> io::Result<()> {
    if metadata.is_dir() {
        fs::remove_dir_all(target)
    } else {
        fs::remove_file(target)
    }
}

/// Renames `target` to `{target}.{YYYYMMDD-HHMMSS}.bak`, adding a counter when
/// that name is taken.
fn move_aside(target: &Path) -> io::Result<PathBuf> {
    let backup = backup_path_for(target);
    fs::rename(target, &backup)?;
    Ok(backup)
}

pub(crate) fn backup_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let mut candidate = target.with_file_name(format!("{name}.{stamp}.bak"));
    let mut counter = 1_u32;
    while fs::symlink_metadata(&candidate).is_ok() {
        candidate = target.with_file_name(format!("{name}.{stamp}-{counter}.bak"));
        counter += 1;
    }
    candidate
}

#[cfg(unix)]
fn create_symlink(source: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, target)
}

#[cfg(windows)]
fn create_symlink(source: &Path, target: &Path) -> io::Result<()> {
    if source.is_dir() {
        std::os::windows::fs::symlink_dir(source, target)
    } else {
        std::os::windows::fs::symlink_file(source, target)
    }
}
