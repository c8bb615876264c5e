use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use rigger_core::{link_state, resolve_target_path, EffectiveSpecification, LinkState};
use rigger_security::validate_path;
use rigger_snapshot::SnapshotManager;
use rigger_state::{StateManager, TransientState};
use serde::Serialize;

use crate::dotfiles::{resolve_target, DotfileService};
use crate::git_ops::is_checkout;
use crate::reconciler::APPLY_OPERATION;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum DotfileState {
    Linked,
    Rendered,
    Mismatch(String),
    Missing,
    Refused(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DotfileStatus {
    pub target: String,
    pub state: DotfileState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryState {
    Present,
    NotCheckout,
    Missing,
    Refused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryStatus {
    pub path: String,
    pub state: RepositoryState,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub spec_name: String,
    pub profile: String,
    pub dotfiles: Vec<DotfileStatus>,
    pub repositories: Vec<RepositoryStatus>,
    pub interrupted: Option<TransientState>,
    pub latest_rollback_point: Option<PathBuf>,
    pub latest_snapshot: Option<PathBuf>,
}

impl StatusReport {
    pub fn is_converged(&self) -> bool {
        self.interrupted.is_none()
            && self
                .dotfiles
                .iter()
                .all(|status| matches!(status.state, DotfileState::Linked | DotfileState::Rendered))
            && self
                .repositories
                .iter()
                .all(|status| status.state == RepositoryState::Present)
    }
}

/// Compares the machine with the specification without changing anything.
pub fn collect_status(
    effective: &EffectiveSpecification,
    dotfiles: &DotfileService<'_>,
    store: &StateManager,
    snapshots: &SnapshotManager,
) -> Result<StatusReport> {
    let name = effective.name();
    let dotfile_states = effective
        .spec
        .dotfiles
        .iter()
        .map(|dotfile| {
            let state = match (
                resolve_target(&dotfile.target),
                dotfiles.resolve_source(&dotfile.source),
            ) {
                (Err(verdict), _) => DotfileState::Refused(verdict.to_string()),
                (_, None) => {
                    DotfileState::Refused("source escapes the configuration directory".to_string())
                }
                (Ok(target), Some(source)) if dotfiles.is_template(&source) => {
                    match (dotfiles.render_source(&source), fs::read_to_string(&target)) {
                        (_, Err(_)) if fs::symlink_metadata(&target).is_err() => {
                            DotfileState::Missing
                        }
                        (Err(err), _) => DotfileState::Mismatch(format!("{err:#}")),
                        (Ok(rendered), Ok(existing)) if rendered == existing => {
                            DotfileState::Rendered
                        }
                        _ => DotfileState::Mismatch("content differs from template".to_string()),
                    }
                }
                (Ok(target), Some(source)) => match link_state(&target, &source) {
                    Ok(LinkState::Ours) => DotfileState::Linked,
                    Ok(LinkState::Absent) => DotfileState::Missing,
                    Ok(LinkState::Elsewhere(destination)) => {
                        DotfileState::Mismatch(format!("links to {}", destination.display()))
                    }
                    Ok(LinkState::Broken(destination)) => DotfileState::Mismatch(format!(
                        "broken link to {}",
                        destination.display()
                    )),
                    Ok(LinkState::NotSymlink) => {
                        DotfileState::Mismatch("exists and is not a symlink".to_string())
                    }
                    Err(err) => DotfileState::Mismatch(err.to_string()),
                },
            };
            DotfileStatus {
                target: dotfile.target.clone(),
                state,
            }
        })
        .collect();

    let repositories = effective
        .spec
        .git
        .repositories
        .iter()
        .map(|repo| {
            let state = if !validate_path(&repo.path).is_ok() {
                RepositoryState::Refused
            } else {
                let path = resolve_target_path(&repo.path);
                if fs::symlink_metadata(&path).is_err() {
                    RepositoryState::Missing
                } else if is_checkout(&path) {
                    RepositoryState::Present
                } else {
                    RepositoryState::NotCheckout
                }
            };
            RepositoryStatus {
                path: repo.path.clone(),
                state,
            }
        })
        .collect();

    Ok(StatusReport {
        spec_name: name.to_string(),
        profile: effective.profile.clone(),
        dotfiles: dotfile_states,
        repositories,
        interrupted: store.read_transient_state(name)?,
        latest_rollback_point: store.list(name, APPLY_OPERATION)?.pop(),
        latest_snapshot: snapshots.latest_snapshot()?,
    })
}
