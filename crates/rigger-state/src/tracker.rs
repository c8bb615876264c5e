use anyhow::Result;
use tracing::debug;

use crate::{ChangeAction, ChangeRecord, Details, RollbackPoint, StateManager};

/// Append-only journal of the changes made during one named operation.
#[derive(Debug, Clone)]
pub struct OperationTracker {
    spec_name: String,
    operation: String,
    records: Vec<ChangeRecord>,
}

impl OperationTracker {
    pub fn new(spec_name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            spec_name: spec_name.into(),
            operation: operation.into(),
            records: Vec::new(),
        }
    }

    pub fn spec_name(&self) -> &str {
        &self.spec_name
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn record_change(&mut self, action: ChangeAction, path: impl Into<String>, details: Details) {
        let mut record = ChangeRecord::new(action, path);
        record.details = details;
        self.record(record);
    }

    pub fn record(&mut self, record: ChangeRecord) {
        debug!(action = %record.action, path = %record.path, "recorded change");
        self.records.push(record);
    }

    pub fn changes(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Persists the journal as a new rollback point. The journal stays readable.
    pub fn flush(&self, store: &StateManager) -> Result<RollbackPoint> {
        store.persist(&self.spec_name, &self.operation, &self.records)
    }
}
