use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, ScopedJoinHandle};

use anyhow::{anyhow, Result};
use rigger_core::{resolve_target_path, Repository};
use rigger_security::validate_path;
use rigger_state::{ChangeAction, ChangeRecord, OperationTracker, STATUS_FAILED, STATUS_SUCCESS};
use tracing::{info, warn};

use crate::git_ops::{is_checkout, GitClient};
use crate::outcome::{journal, ItemOutcome, ProgressSink, RunOptions};

pub const REPOSITORIES_STAGE: &str = "repositories";

type RepoResult = (ItemOutcome, Option<ChangeRecord>);

enum Pending<'scope> {
    Ready(RepoResult),
    Running(ScopedJoinHandle<'scope, RepoResult>),
}

enum Plan {
    Ready(RepoResult),
    Clone(PathBuf),
    Pull(PathBuf),
}

pub struct RepositoryService<'a> {
    git: &'a dyn GitClient,
}

impl<'a> RepositoryService<'a> {
    pub fn new(git: &'a dyn GitClient) -> Self {
        Self { git }
    }

    /// Clones missing repositories and pulls existing checkouts, one thread per
    /// repository. Journal records are appended in input order once every
    /// worker has finished.
    pub fn reconcile(
        &self,
        repositories: &[Repository],
        mut tracker: Option<&mut OperationTracker>,
        options: &RunOptions,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<ItemOutcome>> {
        progress.stage_started(REPOSITORIES_STAGE, repositories.len());

        let plans: Vec<Plan> = repositories
            .iter()
            .map(|repo| plan_repository(repo, options))
            .collect();

        let git = self.git;
        let results = thread::scope(|scope| {
            let pending: Vec<Pending<'_>> = plans
                .into_iter()
                .zip(repositories)
                .map(|(plan, repo)| match plan {
                    Plan::Ready(result) => Pending::Ready(result),
                    Plan::Clone(path) => {
                        Pending::Running(scope.spawn(move || clone_repository(git, repo, &path)))
                    }
                    Plan::Pull(path) => {
                        Pending::Running(scope.spawn(move || pull_repository(git, repo, &path)))
                    }
                })
                .collect();

            pending
                .into_iter()
                .map(|pending| match pending {
                    Pending::Ready(result) => Ok(result),
                    Pending::Running(handle) => handle
                        .join()
                        .map_err(|_| anyhow!("git worker thread panicked")),
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut outcomes = Vec::with_capacity(results.len());
        for (outcome, record) in results {
            if let Some(record) = record {
                journal(&mut tracker, record);
            }
            progress.item_finished(REPOSITORIES_STAGE, &outcome);
            outcomes.push(outcome);
        }
        progress.stage_finished(REPOSITORIES_STAGE);
        Ok(outcomes)
    }
}

fn plan_repository(repo: &Repository, options: &RunOptions) -> Plan {
    let verdict = validate_path(&repo.path);
    if let Some(reason) = verdict.reason() {
        warn!(path = %repo.path, %verdict, "refusing repository path");
        let record = ChangeRecord::new(ChangeAction::SecurityError, repo.path.as_str())
            .with_detail("error", reason)
            .with_detail("url", repo.url.as_str());
        return Plan::Ready((ItemOutcome::failed(&repo.path, verdict.to_string()), Some(record)));
    }

    let path = resolve_target_path(&repo.path);
    let shown = path.display().to_string();
    if fs::symlink_metadata(&path).is_err() {
        if options.dry_run {
            let record = ChangeRecord::new(ChangeAction::WouldCloneRepo, shown.as_str())
                .with_detail("url", repo.url.as_str())
                .with_detail("branch", repo.branch.as_str());
            return Plan::Ready((ItemOutcome::applied(shown, "would clone"), Some(record)));
        }
        return Plan::Clone(path);
    }

    if is_checkout(&path) {
        if options.dry_run {
            let record = ChangeRecord::new(ChangeAction::WouldPullRepo, shown.as_str())
                .with_detail("url", repo.url.as_str());
            return Plan::Ready((ItemOutcome::applied(shown, "would pull"), Some(record)));
        }
        return Plan::Pull(path);
    }

    warn!(path = %shown, "path exists but is not a git checkout, skipping");
    Plan::Ready((
        ItemOutcome::skipped(shown, "exists and is not a git checkout"),
        None,
    ))
}

fn clone_repository(git: &dyn GitClient, repo: &Repository, path: &Path) -> RepoResult {
    let shown = path.display().to_string();
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            return (
                ItemOutcome::failed(shown, format!("failed to create {}: {err}", parent.display())),
                None,
            );
        }
    }

    match git.clone_repo(&repo.url, &repo.branch, path) {
        Ok(()) => {
            info!(url = %repo.url, path = %shown, "cloned repository");
            let record = ChangeRecord::new(ChangeAction::GitCloned, shown.as_str())
                .with_detail("status", STATUS_SUCCESS)
                .with_detail("url", repo.url.as_str())
                .with_detail("branch", repo.branch.as_str());
            (ItemOutcome::applied(shown, "cloned"), Some(record))
        }
        Err(err) => {
            warn!(url = %repo.url, error = %format!("{err:#}"), "clone failed");
            let record = ChangeRecord::new(ChangeAction::GitCloned, shown.as_str())
                .with_detail("status", STATUS_FAILED)
                .with_detail("url", repo.url.as_str())
                .with_detail("branch", repo.branch.as_str())
                .with_detail("error", format!("{err:#}"));
            (ItemOutcome::failed(shown, format!("{err:#}")), Some(record))
        }
    }
}

fn pull_repository(git: &dyn GitClient, repo: &Repository, path: &Path) -> RepoResult {
    let shown = path.display().to_string();
    let previous = git.head(path).ok();
    if let Err(err) = git.pull(path) {
        warn!(path = %shown, error = %format!("{err:#}"), "pull failed");
        let record = ChangeRecord::new(ChangeAction::UpdatedRepo, shown.as_str())
            .with_detail("status", STATUS_FAILED)
            .with_detail("url", repo.url.as_str())
            .with_detail("error", format!("{err:#}"));
        return (ItemOutcome::failed(shown, format!("{err:#}")), Some(record));
    }
    let current = git.head(path).ok();

    if previous == current {
        return (ItemOutcome::skipped(shown, "already up to date"), None);
    }

    info!(path = %shown, "updated repository");
    let mut record = ChangeRecord::new(ChangeAction::UpdatedRepo, shown.as_str())
        .with_detail("status", STATUS_SUCCESS)
        .with_detail("url", repo.url.as_str());
    if let Some(previous) = &previous {
        record = record.with_detail("previous_head", previous.as_str());
    }
    if let Some(current) = &current {
        record = record.with_detail("current_head", current.as_str());
    }
    (ItemOutcome::applied(shown, "updated"), Some(record))
}
