use std::fs;

use anyhow::Result;
use rigger_core::{link_state, EffectiveSpecification, LinkState};
use tracing::{info, warn};

use crate::dotfiles::{resolve_source, resolve_target};
use crate::outcome::{ItemOutcome, ProgressSink, RunOptions};

pub const CLEAN_STAGE: &str = "clean";

/// Removes dotfile symlinks this specification created. Links that point
/// somewhere else and regular files are left alone.
pub fn clean(
    effective: &EffectiveSpecification,
    options: &RunOptions,
    progress: &dyn ProgressSink,
) -> Result<Vec<ItemOutcome>> {
    let dotfiles = &effective.spec.dotfiles;
    progress.stage_started(CLEAN_STAGE, dotfiles.len());
    let mut outcomes = Vec::with_capacity(dotfiles.len());

    for dotfile in dotfiles {
        let outcome = match (
            resolve_target(&dotfile.target),
            resolve_source(effective.base_dir(), &dotfile.source),
        ) {
            (Err(verdict), _) => ItemOutcome::failed(&dotfile.target, verdict.to_string()),
            (_, None) => ItemOutcome::failed(
                &dotfile.target,
                "source escapes the configuration directory",
            ),
            (Ok(target), Some(source)) => {
                let shown = target.display().to_string();
                match link_state(&target, &source) {
                    Ok(LinkState::Ours) | Ok(LinkState::Broken(_)) if options.dry_run => {
                        ItemOutcome::applied(shown, "would remove")
                    }
                    Ok(LinkState::Ours) | Ok(LinkState::Broken(_)) => {
                        match fs::remove_file(&target) {
                            Ok(()) => {
                                info!(target = %shown, "removed symlink");
                                ItemOutcome::applied(shown, "removed")
                            }
                            Err(err) => ItemOutcome::failed(
                                shown,
                                format!("failed to remove symlink: {err}"),
                            ),
                        }
                    }
                    Ok(LinkState::Elsewhere(destination)) => {
                        warn!(target = %shown, destination = %destination.display(), "symlink points elsewhere, leaving it");
                        ItemOutcome::skipped(
                            shown,
                            format!("links to {} instead", destination.display()),
                        )
                    }
                    Ok(LinkState::NotSymlink) => ItemOutcome::skipped(shown, "not a symlink"),
                    Ok(LinkState::Absent) => ItemOutcome::skipped(shown, "absent"),
                    Err(err) => ItemOutcome::failed(shown, format!("failed to inspect: {err}")),
                }
            }
        };
        progress.item_finished(CLEAN_STAGE, &outcome);
        outcomes.push(outcome);
    }

    progress.stage_finished(CLEAN_STAGE);
    Ok(outcomes)
}
