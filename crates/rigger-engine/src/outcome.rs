use std::fmt;

use rigger_state::{ChangeRecord, OperationTracker};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Applied,
    Skipped,
    Failed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of reconciling one package, repository, dotfile or script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    pub item: String,
    pub status: ItemStatus,
    pub detail: String,
}

impl ItemOutcome {
    pub fn applied(item: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(item, ItemStatus::Applied, detail)
    }

    pub fn skipped(item: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(item, ItemStatus::Skipped, detail)
    }

    pub fn failed(item: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(item, ItemStatus::Failed, detail)
    }

    fn with_status(item: impl Into<String>, status: ItemStatus, detail: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            status,
            detail: detail.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == ItemStatus::Failed
    }
}

/// Flags shared by every service call within one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub verbose: bool,
    pub force: bool,
}

/// Receives per-stage progress. Implementations must tolerate stages with zero items.
pub trait ProgressSink {
    fn stage_started(&self, _stage: &str, _total: usize) {}

    fn item_finished(&self, _stage: &str, _outcome: &ItemOutcome) {}

    fn stage_finished(&self, _stage: &str) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

pub(crate) fn journal(tracker: &mut Option<&mut OperationTracker>, record: ChangeRecord) {
    if let Some(tracker) = tracker.as_deref_mut() {
        tracker.record(record);
    }
}

pub(crate) fn truncate_output(raw: &str, limit: usize) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    trimmed.chars().take(limit).collect()
}
