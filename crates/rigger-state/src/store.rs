use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{replay_records, ChangeRecord, StateLayout, UndoReport};

const MAX_SAME_SECOND_POINTS: u32 = 1000;

/// A persisted copy of a completed change journal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackPoint {
    #[serde(skip)]
    pub path: PathBuf,
    pub operation: String,
    pub config_name: String,
    pub timestamp: DateTime<Utc>,
    pub changes: Vec<ChangeRecord>,
}

/// Marker written while an operation is running and removed after it succeeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransientState {
    pub config_name: String,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct StateManager {
    layout: StateLayout,
}

impl StateManager {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn persist(
        &self,
        spec_name: &str,
        operation: &str,
        records: &[ChangeRecord],
    ) -> Result<RollbackPoint> {
        let dir = self.layout.rollback_dir(spec_name);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let timestamp = Utc::now();
        let mut point = RollbackPoint {
            path: PathBuf::new(),
            operation: operation.to_string(),
            config_name: spec_name.to_string(),
            timestamp,
            changes: records.to_vec(),
        };
        let body = serde_json::to_vec_pretty(&point)
            .context("failed to serialize rollback point")?;

        let stem = format!(
            "{}{}",
            self.layout.rollback_file_prefix(spec_name, operation),
            timestamp.format("%Y%m%d_%H%M%S")
        );
        for attempt in 0..MAX_SAME_SECOND_POINTS {
            let name = if attempt == 0 {
                format!("{stem}.json")
            } else {
                format!("{stem}_{attempt:03}.json")
            };
            let path = dir.join(name);
            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to create rollback point: {}", path.display())
                    });
                }
            };
            file.write_all(&body)
                .with_context(|| format!("failed to write rollback point: {}", path.display()))?;
            file.flush()
                .with_context(|| format!("failed to flush rollback point: {}", path.display()))?;

            info!(
                spec = spec_name,
                operation,
                changes = records.len(),
                path = %path.display(),
                "persisted rollback point"
            );
            point.path = path;
            return Ok(point);
        }

        Err(anyhow!(
            "too many rollback points for '{spec_name}' operation '{operation}' in one second"
        ))
    }

    /// Rollback point files for the pair, oldest first.
    pub fn list(&self, spec_name: &str, operation: &str) -> Result<Vec<PathBuf>> {
        let dir = self.layout.rollback_dir(spec_name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read rollback directory: {}", dir.display())
                });
            }
        };

        let prefix = self.layout.rollback_file_prefix(spec_name, operation);
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to iterate rollback directory: {}", dir.display())
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            if rest.starts_with(|ch: char| ch.is_ascii_digit()) && rest.ends_with(".json") {
                names.push(name);
            }
        }
        names.sort();

        Ok(names.into_iter().map(|name| dir.join(name)).collect())
    }

    pub fn latest(&self, spec_name: &str, operation: &str) -> Result<Option<RollbackPoint>> {
        match self.list(spec_name, operation)?.last() {
            Some(path) => self.load(path).map(Some),
            None => Ok(None),
        }
    }

    pub fn load(&self, path: &Path) -> Result<RollbackPoint> {
        let raw = fs::read(path)
            .with_context(|| format!("failed to read rollback point: {}", path.display()))?;
        let mut point: RollbackPoint = serde_json::from_slice(&raw)
            .with_context(|| format!("failed parsing rollback point: {}", path.display()))?;
        point.path = path.to_path_buf();
        Ok(point)
    }

    pub fn replay(&self, point: &RollbackPoint) -> UndoReport {
        info!(
            spec = %point.config_name,
            operation = %point.operation,
            changes = point.changes.len(),
            "replaying rollback point"
        );
        replay_records(&point.changes)
    }

    pub fn mark_in_progress(&self, spec_name: &str, operation: &str) -> Result<PathBuf> {
        let state = TransientState {
            config_name: spec_name.to_string(),
            operation: operation.to_string(),
            timestamp: Utc::now(),
            data: serde_json::json!({ "status": "in_progress" }),
        };
        let path = self.layout.transient_state_path(spec_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let body =
            serde_json::to_vec_pretty(&state).context("failed to serialize transient state")?;
        fs::write(&path, body)
            .with_context(|| format!("failed to write transient state: {}", path.display()))?;
        debug!(spec = spec_name, operation, "marked operation in progress");
        Ok(path)
    }

    pub fn read_transient_state(&self, spec_name: &str) -> Result<Option<TransientState>> {
        let path = self.layout.transient_state_path(spec_name);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read transient state: {}", path.display())
                });
            }
        };
        let state = serde_json::from_slice(&raw)
            .with_context(|| format!("failed parsing transient state: {}", path.display()))?;
        Ok(Some(state))
    }

    pub fn clear_transient_state(&self, spec_name: &str) -> Result<()> {
        let path = self.layout.transient_state_path(spec_name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("failed to clear transient state: {}", path.display())
            }),
        }
    }
}
