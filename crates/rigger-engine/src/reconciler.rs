use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use rigger_core::{EffectiveSpecification, HookPoint};
use rigger_state::{
    replay_records, ChangeAction, ChangeRecord, OperationTracker, SpecLock, StateManager,
    UndoReport,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::capabilities::Capabilities;
use crate::dotfiles::DotfileService;
use crate::outcome::{ItemOutcome, ItemStatus, NoProgress, ProgressSink, RunOptions};
use crate::packages::PackageService;
use crate::repositories::RepositoryService;
use crate::scripts::ScriptService;

pub const APPLY_OPERATION: &str = "apply";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PreSystem,
    InstallPackages,
    PostSystem,
    PreGit,
    ProcessRepositories,
    PostGit,
    PreDotfiles,
    LinkDotfiles,
    PostDotfiles,
    PreScripts,
    RunScripts,
    PostScripts,
    Complete,
}

impl Stage {
    /// Stages that do work, in execution order. `Complete` follows the last one.
    pub const WORK: [Stage; 12] = [
        Stage::PreSystem,
        Stage::InstallPackages,
        Stage::PostSystem,
        Stage::PreGit,
        Stage::ProcessRepositories,
        Stage::PostGit,
        Stage::PreDotfiles,
        Stage::LinkDotfiles,
        Stage::PostDotfiles,
        Stage::PreScripts,
        Stage::RunScripts,
        Stage::PostScripts,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreSystem => "pre_system",
            Self::InstallPackages => "install_packages",
            Self::PostSystem => "post_system",
            Self::PreGit => "pre_git",
            Self::ProcessRepositories => "process_repositories",
            Self::PostGit => "post_git",
            Self::PreDotfiles => "pre_dotfiles",
            Self::LinkDotfiles => "link_dotfiles",
            Self::PostDotfiles => "post_dotfiles",
            Self::PreScripts => "pre_scripts",
            Self::RunScripts => "run_scripts",
            Self::PostScripts => "post_scripts",
            Self::Complete => "complete",
        }
    }

    pub fn hook_point(self) -> Option<HookPoint> {
        match self {
            Self::PreSystem => Some(HookPoint::PreSystem),
            Self::PostSystem => Some(HookPoint::PostSystem),
            Self::PreGit => Some(HookPoint::PreGit),
            Self::PostGit => Some(HookPoint::PostGit),
            Self::PreDotfiles => Some(HookPoint::PreDotfiles),
            Self::PostDotfiles => Some(HookPoint::PostDotfiles),
            Self::PreScripts => Some(HookPoint::PreScripts),
            Self::PostScripts => Some(HookPoint::PostScripts),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared flag checked between stages; cancelling aborts the run at the next boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub run: RunOptions,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub outcomes: Vec<ItemOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub stages: Vec<StageReport>,
    pub rollback_point: Option<PathBuf>,
    pub records: Vec<ChangeRecord>,
    pub dry_run: bool,
}

impl ApplyReport {
    pub fn outcomes(&self) -> impl Iterator<Item = (Stage, &ItemOutcome)> {
        self.stages
            .iter()
            .flat_map(|report| report.outcomes.iter().map(move |outcome| (report.stage, outcome)))
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.outcomes()
            .filter(|(_, outcome)| outcome.status == status)
            .count()
    }

    pub fn failures(&self) -> usize {
        self.count(ItemStatus::Failed)
    }

    pub fn records_with(&self, action: ChangeAction) -> usize {
        self.records
            .iter()
            .filter(|record| record.action == action)
            .count()
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("apply aborted during {stage}: {cause:#}")]
    Aborted {
        stage: Stage,
        cause: anyhow::Error,
        undo: UndoReport,
    },
    #[error("failed to persist rollback point: {0:#}")]
    Persist(anyhow::Error),
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

/// Drives one specification through every stage in order.
pub struct Reconciler<'a> {
    effective: &'a EffectiveSpecification,
    store: &'a StateManager,
    capabilities: &'a Capabilities,
    progress: &'a dyn ProgressSink,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        effective: &'a EffectiveSpecification,
        store: &'a StateManager,
        capabilities: &'a Capabilities,
    ) -> Self {
        Self {
            effective,
            store,
            capabilities,
            progress: &NoProgress,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// Runs every stage. A fault or panic escaping a stage, or cancellation, undoes the
    /// changes journaled so far and returns [`ApplyError::Aborted`]. A completed
    /// run persists its journal as one rollback point.
    pub fn apply(&self, options: &ApplyOptions) -> Result<ApplyReport, ApplyError> {
        let name = self.effective.name();
        let dry_run = options.run.dry_run;

        let _lock = if dry_run {
            None
        } else {
            self.store.layout().ensure_base_dirs()?;
            let lock = SpecLock::acquire(self.store.layout(), name)?;
            self.store.mark_in_progress(name, APPLY_OPERATION)?;
            Some(lock)
        };

        let mut tracker = OperationTracker::new(name, APPLY_OPERATION);
        let mut stages = Vec::with_capacity(Stage::WORK.len());
        for stage in Stage::WORK {
            if options.cancel.is_cancelled() {
                let cause = anyhow!("apply cancelled before {stage}");
                return Err(self.abort(stage, cause, &tracker, dry_run));
            }
            info!(stage = %stage, "entering stage");
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                self.run_stage(stage, &mut tracker, &options.run)
            }))
            .unwrap_or_else(|payload| {
                Err(anyhow!("{stage} panicked: {}", panic_message(payload.as_ref())))
            });
            match result {
                Ok(outcomes) => stages.push(StageReport { stage, outcomes }),
                Err(cause) => return Err(self.abort(stage, cause, &tracker, dry_run)),
            }
        }

        let rollback_point = if dry_run {
            None
        } else {
            let point = tracker.flush(self.store).map_err(ApplyError::Persist)?;
            if let Err(err) = self.store.clear_transient_state(name) {
                warn!(error = %format!("{err:#}"), "failed to clear in-progress marker");
            }
            Some(point.path)
        };
        info!(stage = %Stage::Complete, records = tracker.len(), "apply finished");

        Ok(ApplyReport {
            stages,
            rollback_point,
            records: tracker.changes().to_vec(),
            dry_run,
        })
    }

    fn run_stage(
        &self,
        stage: Stage,
        tracker: &mut OperationTracker,
        run: &RunOptions,
    ) -> anyhow::Result<Vec<ItemOutcome>> {
        let spec = &self.effective.spec;
        let caps = self.capabilities;
        match stage {
            Stage::InstallPackages => PackageService::new(caps.installer.as_ref()).reconcile(
                &spec.system.packages,
                Some(tracker),
                run,
                self.progress,
            ),
            Stage::ProcessRepositories => RepositoryService::new(caps.git.as_ref()).reconcile(
                &spec.git.repositories,
                Some(tracker),
                run,
                self.progress,
            ),
            Stage::LinkDotfiles => DotfileService::new(
                caps.renderer.as_ref(),
                self.effective.base_dir(),
                &spec.variables,
            )
            .with_template_extension(caps.template_extension.clone())
            .reconcile(&spec.dotfiles, Some(tracker), run, self.progress),
            Stage::RunScripts => self.scripts().run_scripts(
                &spec.scripts,
                Some(tracker),
                run,
                self.progress,
            ),
            other => match other.hook_point() {
                Some(point) if !spec.hooks.list(point).is_empty() => self.scripts().run_hooks(
                    point,
                    spec.hooks.list(point),
                    Some(tracker),
                    run,
                    self.progress,
                ),
                _ => Ok(Vec::new()),
            },
        }
    }

    fn scripts(&self) -> ScriptService<'_> {
        ScriptService::new(self.capabilities.runner.as_ref(), self.effective.base_dir())
    }

    fn abort(
        &self,
        stage: Stage,
        cause: anyhow::Error,
        tracker: &OperationTracker,
        dry_run: bool,
    ) -> ApplyError {
        error!(stage = %stage, error = %format!("{cause:#}"), "apply aborted");
        let undo = if dry_run {
            UndoReport::default()
        } else {
            let undo = replay_records(tracker.changes());
            if let Err(err) = self.store.clear_transient_state(self.effective.name()) {
                warn!(error = %format!("{err:#}"), "failed to clear in-progress marker");
            }
            undo
        };
        ApplyError::Aborted { stage, cause, undo }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic payload")
}

/// Replays the newest rollback point recorded for `operation`, holding the
/// specification lock while doing so. Returns `None` when nothing was recorded.
pub fn rollback_latest(
    store: &StateManager,
    spec_name: &str,
    operation: &str,
) -> anyhow::Result<Option<UndoReport>> {
    store.layout().ensure_base_dirs()?;
    let _lock = SpecLock::acquire(store.layout(), spec_name)?;
    let Some(point) = store.latest(spec_name, operation)? else {
        return Ok(None);
    };
    info!(path = %point.path.display(), changes = point.changes.len(), "replaying rollback point");
    Ok(Some(store.replay(&point)))
}
