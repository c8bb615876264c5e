use std::fs;

use rigger_core::{link_state, Dotfile, LinkState};
use serde::Serialize;

use crate::dotfiles::{resolve_target, DotfileService};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    New,
    Changed,
    Unchanged,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DotfileDiff {
    pub target: String,
    pub kind: DiffKind,
    /// Unified diff from the current target to the desired content, when both are text.
    pub patch: Option<String>,
    pub note: Option<String>,
}

impl DotfileDiff {
    fn new(target: impl Into<String>, kind: DiffKind) -> Self {
        Self {
            target: target.into(),
            kind,
            patch: None,
            note: None,
        }
    }

    fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Describes what applying the dotfile section would change, one entry per dotfile.
pub fn diff_dotfiles(service: &DotfileService<'_>, dotfiles: &[Dotfile]) -> Vec<DotfileDiff> {
    dotfiles
        .iter()
        .map(|dotfile| diff_one(service, dotfile))
        .collect()
}

fn diff_one(service: &DotfileService<'_>, dotfile: &Dotfile) -> DotfileDiff {
    let target = match resolve_target(&dotfile.target) {
        Ok(target) => target,
        Err(verdict) => {
            return DotfileDiff::new(&dotfile.target, DiffKind::Skipped)
                .with_note(verdict.to_string());
        }
    };
    let shown = target.display().to_string();
    let Some(source) = service.resolve_source(&dotfile.source) else {
        return DotfileDiff::new(shown, DiffKind::Skipped)
            .with_note("source escapes the configuration directory");
    };

    if fs::symlink_metadata(&target).is_err() {
        return DotfileDiff::new(shown, DiffKind::New);
    }

    let desired = if service.is_template(&source) {
        match service.render_source(&source) {
            Ok(rendered) => rendered,
            Err(err) => {
                return DotfileDiff::new(shown, DiffKind::Skipped)
                    .with_note(format!("{err:#}"));
            }
        }
    } else {
        match link_state(&target, &source) {
            Ok(LinkState::Ours) => return DotfileDiff::new(shown, DiffKind::Unchanged),
            Ok(LinkState::Elsewhere(destination)) | Ok(LinkState::Broken(destination)) => {
                return DotfileDiff::new(shown, DiffKind::Changed)
                    .with_note(format!("currently links to {}", destination.display()));
            }
            _ => {}
        }
        match fs::read_to_string(&source) {
            Ok(content) => content,
            Err(_) => {
                return DotfileDiff::new(shown, DiffKind::Changed)
                    .with_note("source is not a text file");
            }
        }
    };

    let current = match fs::read_to_string(&target) {
        Ok(current) => current,
        Err(_) => {
            return DotfileDiff::new(shown, DiffKind::Changed)
                .with_note("existing target is not a text file");
        }
    };
    if current == desired {
        if service.is_template(&source) {
            return DotfileDiff::new(shown, DiffKind::Unchanged);
        }
        return DotfileDiff::new(shown, DiffKind::Changed)
            .with_note("content matches; target would become a symlink");
    }

    let mut diff = DotfileDiff::new(shown, DiffKind::Changed);
    diff.patch = Some(diffy::create_patch(&current, &desired).to_string());
    diff
}
