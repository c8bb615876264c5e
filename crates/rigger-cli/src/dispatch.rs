use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rigger_core::{
    default_rigger_home, load_specification, local_document_path, profile_document_path,
    write_default_specification, EffectiveSpecification, HostProfileDetector, ProfileDetector,
    RigSettings,
};
use rigger_engine::{
    clean, collect_status, diff_dotfiles, rollback_latest, sync_repositories, watch_documents,
    ApplyError, ApplyOptions, CancelToken, Capabilities, DotfileService, InventoryPlugin,
    MiniJinjaRenderer, PluginRegistry, Reconciler, RunOptions, SystemGit, CLEAN_STAGE,
    SYNC_STAGE,
};
use rigger_snapshot::{RestoreOutcome, SnapshotError, SnapshotManager};
use rigger_state::{SpecLock, StateLayout, StateManager};
use tracing::{debug, info};

use crate::cli::{Cli, Commands};
use crate::completion::write_completions_script;
use crate::interrupt::install_interrupt_handler;
use crate::render::{
    format_apply_summary_lines, format_diff_lines, format_mismatch_lines, format_plugin_lines,
    format_restore_lines, format_status_lines, format_undo_lines, TerminalProgress,
    TerminalRenderer,
};

/// Per-invocation state resolved from the rigger home directory.
pub struct RigContext {
    pub settings: RigSettings,
    pub store: StateManager,
    pub snapshots: SnapshotManager,
}

impl RigContext {
    pub fn load() -> Result<Self> {
        let home = default_rigger_home()?;
        Self::from_home(&home)
    }

    pub fn from_home(home: &Path) -> Result<Self> {
        let settings = RigSettings::load(home)?;
        let store = StateManager::new(StateLayout::new(settings.state_dir(home)));
        let snapshots = SnapshotManager::new(settings.backup_dir(home));
        debug!(home = %home.display(), "resolved rigger home");
        Ok(Self {
            settings,
            store,
            snapshots,
        })
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

pub fn run_options(cli: &Cli) -> RunOptions {
    RunOptions {
        dry_run: cli.dry_run,
        verbose: cli.verbose,
        force: cli.force,
    }
}

pub fn load_effective(config: &Path, profile: Option<&str>) -> Result<EffectiveSpecification> {
    let effective = load_specification(config, profile, &HostProfileDetector)?;
    info!(
        spec = %effective.name(),
        profile = %effective.profile,
        "loaded specification"
    );
    Ok(effective)
}

pub fn run_cli(cli: Cli) -> Result<ExitCode> {
    let renderer = TerminalRenderer::current();
    let options = run_options(&cli);

    match &cli.command {
        Commands::Init { path } => {
            write_default_specification(path)?;
            renderer.print_status("ok", &format!("wrote {}", path.display()));
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Detect => {
            println!("{}", HostProfileDetector.detect());
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout();
            write_completions_script(*shell, &mut stdout)?;
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let context = RigContext::load()?;
    let effective = load_effective(&cli.config, cli.profile.as_deref())?;

    match cli.command {
        Commands::Apply => {
            let cancel = CancelToken::new();
            install_interrupt_handler(&cancel)?;
            let success = run_apply(&effective, &context, options, &cancel, renderer)?;
            Ok(exit_code(success))
        }
        Commands::Clean => {
            let progress = TerminalProgress::new(renderer.style());
            let outcomes = clean(&effective, &options, &progress)?;
            let failed = outcomes.iter().filter(|outcome| outcome.is_failed()).count();
            renderer.print_status(
                if failed == 0 { "ok" } else { "err" },
                &format!("{CLEAN_STAGE}: {} targets, {failed} failed", outcomes.len()),
            );
            Ok(exit_code(failed == 0))
        }
        Commands::Validate => {
            renderer.print_status(
                "ok",
                &format!("specification '{}' is valid", cli.config.display()),
            );
            renderer.print_status("step", &InventoryPlugin::summary(&effective));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Backup => {
            if options.dry_run {
                renderer.print_status(
                    "step",
                    &format!(
                        "would create a snapshot in {}",
                        context.snapshots.backup_dir().display()
                    ),
                );
                return Ok(ExitCode::SUCCESS);
            }
            let archive = context.snapshots.create_snapshot(&effective)?;
            renderer.print_status("ok", &format!("snapshot written to {}", archive.display()));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Restore { snapshot } => {
            let archive = resolve_snapshot_path(&context.snapshots, &snapshot)?;
            run_restore(&effective, &context, &archive, options, renderer)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rollback {
            operation,
            from_backup,
        } => {
            let success = if from_backup {
                run_rollback_from_backup(&effective, &context, options, renderer)?
            } else {
                run_rollback(&effective, &context, &operation, options, renderer)?
            };
            Ok(exit_code(success))
        }
        Commands::Status { json } => {
            let renderer_impl = MiniJinjaRenderer;
            let service = DotfileService::new(
                &renderer_impl,
                effective.base_dir(),
                &effective.spec.variables,
            )
            .with_template_extension(&context.settings.template_extension);
            let report =
                collect_status(&effective, &service, &context.store, &context.snapshots)?;
            if json {
                let rendered = serde_json::to_string_pretty(&report)
                    .context("failed to serialize status report")?;
                println!("{rendered}");
            } else {
                renderer.print_lines(&format_status_lines(&report, renderer.style()));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Diff => {
            let renderer_impl = MiniJinjaRenderer;
            let service = DotfileService::new(
                &renderer_impl,
                effective.base_dir(),
                &effective.spec.variables,
            )
            .with_template_extension(&context.settings.template_extension);
            let diffs = diff_dotfiles(&service, &effective.spec.dotfiles);
            renderer.print_lines(&format_diff_lines(&diffs, renderer.style()));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sync => {
            let progress = TerminalProgress::new(renderer.style());
            let outcomes = sync_repositories(
                &SystemGit,
                &effective.spec.git.repositories,
                &options,
                &progress,
            )?;
            let failed = outcomes.iter().filter(|outcome| outcome.is_failed()).count();
            renderer.print_status(
                if failed == 0 { "ok" } else { "err" },
                &format!(
                    "{SYNC_STAGE}: {} repositories, {failed} failed",
                    outcomes.len()
                ),
            );
            Ok(exit_code(failed == 0))
        }
        Commands::Watch => {
            let stop = CancelToken::new();
            install_interrupt_handler(&stop)?;
            run_watch(&cli.config, &effective, &context, options, &stop, renderer)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plugins { names } => {
            let registry = PluginRegistry::with_builtins();
            let outcomes = registry.run(&names, &effective, &options)?;
            renderer.print_lines(&format_plugin_lines(&outcomes, renderer.style()));
            Ok(exit_code(outcomes.iter().all(|outcome| outcome.success)))
        }
        Commands::Init { .. } | Commands::Detect | Commands::Completions { .. } => {
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Runs one apply and prints its summary. Returns false when any item failed.
/// Cancelling `cancel` aborts at the next stage boundary and undoes the run.
pub fn run_apply(
    effective: &EffectiveSpecification,
    context: &RigContext,
    options: RunOptions,
    cancel: &CancelToken,
    renderer: TerminalRenderer,
) -> Result<bool> {
    let capabilities = Capabilities::system(&context.settings);
    let progress = TerminalProgress::new(renderer.style());
    let result = Reconciler::new(effective, &context.store, &capabilities)
        .with_progress(&progress)
        .apply(&ApplyOptions {
            run: options,
            cancel: cancel.clone(),
        });

    match result {
        Ok(report) => {
            renderer.print_lines(&format_apply_summary_lines(&report, renderer.style()));
            Ok(report.failures() == 0)
        }
        Err(ApplyError::Aborted { stage, cause, undo }) => {
            renderer.print_section("rollback");
            renderer.print_lines(&format_undo_lines(&undo, renderer.style()));
            Err(cause.context(format!("apply aborted during {stage}")))
        }
        Err(err) => Err(err.into()),
    }
}

pub fn resolve_snapshot_path(snapshots: &SnapshotManager, raw: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(raw);
    if direct.is_file() {
        return Ok(direct);
    }
    let in_backup_dir = snapshots.backup_dir().join(raw);
    if in_backup_dir.is_file() {
        return Ok(in_backup_dir);
    }
    Err(SnapshotError::NotFound(direct).into())
}

fn run_restore(
    effective: &EffectiveSpecification,
    context: &RigContext,
    archive: &Path,
    options: RunOptions,
    renderer: TerminalRenderer,
) -> Result<()> {
    if options.dry_run {
        let manifest = context.snapshots.read_manifest(archive)?;
        for entry in &manifest.dotfiles {
            renderer.print_status("step", &format!("would restore {}", entry.target));
        }
        return Ok(());
    }

    let _lock = SpecLock::acquire(context.store.layout(), effective.name())?;
    let restored = context.snapshots.restore_snapshot(archive)?;
    renderer.print_status(
        "ok",
        &format!("restored {restored} entries from {}", archive.display()),
    );
    let mismatches = context.snapshots.verify_snapshot(archive)?;
    renderer.print_lines(&format_mismatch_lines(&mismatches, renderer.style()));
    Ok(())
}

fn run_rollback(
    effective: &EffectiveSpecification,
    context: &RigContext,
    operation: &str,
    options: RunOptions,
    renderer: TerminalRenderer,
) -> Result<bool> {
    let name = effective.name();
    if options.dry_run {
        let Some(point) = context.store.latest(name, operation)? else {
            renderer.print_status("step", &format!("no rollback point for {name} {operation}"));
            return Ok(true);
        };
        renderer.print_status(
            "step",
            &format!("would replay {}", point.path.display()),
        );
        for record in point
            .changes
            .iter()
            .rev()
            .filter(|record| record.action.is_mutation() && !record.is_failed())
        {
            renderer.print_status("step", &format!("would undo {} {}", record.action, record.path));
        }
        return Ok(true);
    }

    match rollback_latest(&context.store, name, operation)? {
        Some(undo) => {
            renderer.print_lines(&format_undo_lines(&undo, renderer.style()));
            Ok(!undo.has_errors())
        }
        None => {
            renderer.print_status("step", &format!("no rollback point for {name} {operation}"));
            Ok(true)
        }
    }
}

fn run_rollback_from_backup(
    effective: &EffectiveSpecification,
    context: &RigContext,
    options: RunOptions,
    renderer: TerminalRenderer,
) -> Result<bool> {
    let archive = context.snapshots.latest_snapshot()?.ok_or_else(|| {
        anyhow!(
            "no snapshots found in {}",
            context.snapshots.backup_dir().display()
        )
    })?;
    let manifest = context.snapshots.read_manifest(&archive)?;
    if options.dry_run {
        for entry in &manifest.dotfiles {
            renderer.print_status("step", &format!("would restore {}", entry.target));
        }
        return Ok(true);
    }

    let _lock = SpecLock::acquire(context.store.layout(), effective.name())?;
    let items = context.snapshots.restore_from_manifest(&archive, &manifest)?;
    renderer.print_lines(&format_restore_lines(&items, renderer.style()));
    Ok(items.iter().all(|item| {
        matches!(
            item.outcome,
            RestoreOutcome::Restored | RestoreOutcome::NotFoundInArchive
        )
    }))
}

/// Documents whose change triggers a re-apply: the base file and its overlays.
pub fn watched_documents(config: &Path, profile: &str) -> Vec<PathBuf> {
    vec![
        config.to_path_buf(),
        profile_document_path(config, profile),
        local_document_path(config),
    ]
}

fn run_watch(
    config: &Path,
    effective: &EffectiveSpecification,
    context: &RigContext,
    options: RunOptions,
    stop: &CancelToken,
    renderer: TerminalRenderer,
) -> Result<()> {
    let profile = effective.profile.clone();
    let documents = watched_documents(config, &profile);
    renderer.print_status(
        "step",
        &format!("watching {} for changes (Ctrl+C to stop)", config.display()),
    );

    watch_documents(
        &documents,
        Duration::from_millis(context.settings.watch_debounce_ms),
        stop,
        || {
            renderer.print_status("warn", "specification changed, applying");
            let reloaded = load_effective(config, Some(&profile))?;
            if !run_apply(&reloaded, context, options, stop, renderer)? {
                renderer.print_status("err", "apply finished with failures");
            }
            Ok(())
        },
    )
}
