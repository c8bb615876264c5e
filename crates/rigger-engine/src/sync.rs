use std::fs;
use std::thread;

use anyhow::{anyhow, Result};
use rigger_core::{resolve_target_path, Repository};
use rigger_security::validate_path;
use tracing::{info, warn};

use crate::git_ops::{is_checkout, GitClient};
use crate::outcome::{ItemOutcome, ProgressSink, RunOptions};

pub const SYNC_STAGE: &str = "sync";

/// Pushes every repository checkout concurrently. Uncommitted changes are
/// reported as a warning and do not stop the push.
pub fn sync_repositories(
    git: &dyn GitClient,
    repositories: &[Repository],
    options: &RunOptions,
    progress: &dyn ProgressSink,
) -> Result<Vec<ItemOutcome>> {
    progress.stage_started(SYNC_STAGE, repositories.len());

    let outcomes = thread::scope(|scope| {
        let handles: Vec<_> = repositories
            .iter()
            .map(|repo| scope.spawn(move || sync_one(git, repo, options)))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow!("git worker thread panicked"))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    for outcome in &outcomes {
        progress.item_finished(SYNC_STAGE, outcome);
    }
    progress.stage_finished(SYNC_STAGE);
    Ok(outcomes)
}

fn sync_one(git: &dyn GitClient, repo: &Repository, options: &RunOptions) -> ItemOutcome {
    let verdict = validate_path(&repo.path);
    if !verdict.is_ok() {
        return ItemOutcome::failed(&repo.path, verdict.to_string());
    }
    let path = resolve_target_path(&repo.path);
    let shown = path.display().to_string();

    if fs::symlink_metadata(&path).is_err() {
        return ItemOutcome::skipped(shown, "not cloned");
    }
    if !is_checkout(&path) {
        warn!(path = %shown, "not a git checkout, skipping sync");
        return ItemOutcome::skipped(shown, "not a git checkout");
    }

    match git.status_porcelain(&path) {
        Ok(status) if !status.trim().is_empty() => {
            warn!(path = %shown, "repository has uncommitted changes");
        }
        Ok(_) => {}
        Err(err) => warn!(path = %shown, error = %format!("{err:#}"), "git status failed"),
    }

    if options.dry_run {
        return ItemOutcome::applied(shown, "would push");
    }
    match git.push(&path) {
        Ok(()) => {
            info!(path = %shown, "pushed repository");
            ItemOutcome::applied(shown, "pushed")
        }
        Err(err) => ItemOutcome::failed(shown, format!("{err:#}")),
    }
}
