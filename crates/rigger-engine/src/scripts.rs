use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rigger_core::{HookPoint, Script};
use rigger_security::{expand_user_path, validate_command, validate_path, CommandVerdict};
use rigger_state::{ChangeAction, ChangeRecord, OperationTracker, STATUS_FAILED, STATUS_SUCCESS};
use tracing::{info, warn};

use crate::outcome::{journal, truncate_output, ItemOutcome, ProgressSink, RunOptions};
use crate::process::CommandRunner;

pub const SCRIPTS_STAGE: &str = "scripts";
const OUTPUT_LIMIT_CHARS: usize = 500;

/// Runs user scripts and lifecycle hooks after checking them for unsafe constructs.
pub struct ScriptService<'a> {
    runner: &'a dyn CommandRunner,
    base_dir: &'a Path,
}

impl<'a> ScriptService<'a> {
    pub fn new(runner: &'a dyn CommandRunner, base_dir: &'a Path) -> Self {
        Self { runner, base_dir }
    }

    /// Runs `pre` and `both` scripts, then `post` and `both` scripts.
    pub fn run_scripts(
        &self,
        scripts: &[Script],
        mut tracker: Option<&mut OperationTracker>,
        options: &RunOptions,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<ItemOutcome>> {
        let pre: Vec<&Script> = scripts
            .iter()
            .filter(|script| script.when.runs_in_pre_pass())
            .collect();
        let post: Vec<&Script> = scripts
            .iter()
            .filter(|script| script.when.runs_in_post_pass())
            .collect();

        progress.stage_started(SCRIPTS_STAGE, pre.len() + post.len());
        let mut outcomes = Vec::with_capacity(pre.len() + post.len());
        for (pass, batch) in [("pre", pre), ("post", post)] {
            for script in batch {
                let outcome = self.run_one(script, Origin::Script(pass), &mut tracker, options)?;
                progress.item_finished(SCRIPTS_STAGE, &outcome);
                outcomes.push(outcome);
            }
        }
        progress.stage_finished(SCRIPTS_STAGE);
        Ok(outcomes)
    }

    pub fn run_hooks(
        &self,
        point: HookPoint,
        hooks: &[Script],
        mut tracker: Option<&mut OperationTracker>,
        options: &RunOptions,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<ItemOutcome>> {
        let stage = point.as_str();
        progress.stage_started(stage, hooks.len());
        let mut outcomes = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let outcome = self.run_one(hook, Origin::Hook(point), &mut tracker, options)?;
            progress.item_finished(stage, &outcome);
            outcomes.push(outcome);
        }
        progress.stage_finished(stage);
        Ok(outcomes)
    }

    fn run_one(
        &self,
        script: &Script,
        origin: Origin,
        tracker: &mut Option<&mut OperationTracker>,
        options: &RunOptions,
    ) -> Result<ItemOutcome> {
        let label = script.label().to_string();

        if let CommandVerdict::Unsafe(reason) = validate_command(&script.command) {
            warn!(command = %script.command, reason = %reason, "refusing unsafe command");
            journal(
                tracker,
                origin.annotate(
                    ChangeRecord::new(ChangeAction::SecurityError, script.command.as_str())
                        .with_detail("error", reason.as_str()),
                ),
            );
            return Ok(ItemOutcome::failed(label, format!("unsafe command: {reason}")));
        }

        let cwd = match &script.cwd {
            None => self.base_dir.to_path_buf(),
            Some(raw) => {
                let verdict = validate_path(raw);
                if let Some(reason) = verdict.reason() {
                    warn!(command = %script.command, cwd = %raw, %verdict, "refusing working directory");
                    journal(
                        tracker,
                        origin.annotate(
                            ChangeRecord::new(ChangeAction::SecurityError, script.command.as_str())
                                .with_detail("error", reason)
                                .with_detail("cwd", raw.as_str()),
                        ),
                    );
                    return Ok(ItemOutcome::failed(label, verdict.to_string()));
                }
                self.resolve_cwd(raw)
            }
        };

        if options.dry_run {
            journal(
                tracker,
                origin.annotate(
                    ChangeRecord::new(ChangeAction::WouldExecuteScript, script.command.as_str())
                        .with_detail("cwd", cwd.display().to_string()),
                ),
            );
            return Ok(ItemOutcome::applied(label, "would run"));
        }

        let mut record = origin.annotate(
            ChangeRecord::new(ChangeAction::ExecutedScript, script.command.as_str())
                .with_detail("cwd", cwd.display().to_string()),
        );
        if let Some(description) = &script.description {
            record = record.with_detail("description", description.as_str());
        }

        if !cwd.is_dir() {
            let error = format!("working directory {} does not exist", cwd.display());
            warn!(command = %script.command, error = %error, "script not run");
            journal(
                tracker,
                record
                    .with_detail("status", STATUS_FAILED)
                    .with_detail("error", error.as_str()),
            );
            return Ok(ItemOutcome::failed(label, error));
        }

        let output = self
            .runner
            .run(&script.command, &cwd)
            .with_context(|| format!("failed to run '{}'", script.command))?;

        if output.success {
            info!(command = %script.command, "script finished");
            journal(
                tracker,
                record
                    .with_detail("status", STATUS_SUCCESS)
                    .with_detail("output", truncate_output(&output.stdout, OUTPUT_LIMIT_CHARS)),
            );
            return Ok(ItemOutcome::applied(label, "ran"));
        }

        let error = if output.timed_out {
            "timed out".to_string()
        } else {
            match output.exit_code {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by signal".to_string(),
            }
        };
        warn!(command = %script.command, error = %error, "script failed");
        journal(
            tracker,
            record
                .with_detail("status", STATUS_FAILED)
                .with_detail("error", error.as_str())
                .with_detail("stderr", truncate_output(&output.stderr, OUTPUT_LIMIT_CHARS)),
        );
        Ok(ItemOutcome::failed(label, error))
    }

    fn resolve_cwd(&self, raw: &str) -> PathBuf {
        let expanded = expand_user_path(raw);
        if expanded.is_absolute() {
            expanded
        } else {
            self.base_dir.join(expanded)
        }
    }
}

/// Where a command came from: a script pass or a named hook list.
#[derive(Debug, Clone, Copy)]
enum Origin {
    Script(&'static str),
    Hook(HookPoint),
}

impl Origin {
    fn annotate(self, record: ChangeRecord) -> ChangeRecord {
        match self {
            Self::Script(pass) => record.with_detail("pass", pass),
            Self::Hook(point) => record.with_detail("hook", point.as_str()),
        }
    }
}
