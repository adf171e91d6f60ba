//! Snapshot, lineage and change records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Immutable view of a message's context fields at one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub message_id: String,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    /// Field name to value; `None` marks a known-but-unset field.
    pub fields: BTreeMap<String, Option<String>>,
    pub field_count: usize,
    /// Estimated serialized size of the captured fields.
    pub size_bytes: usize,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ContextSnapshot {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_deref())
    }
}

/// Ordered history of snapshots and boundary crossings for one correlation id.
#[derive(Debug, Clone, Serialize)]
pub struct ContextLineage {
    pub correlation_id: String,
    pub origin_message_id: String,
    pub start_time: DateTime<Utc>,
    pub snapshots: Vec<Arc<ContextSnapshot>>,
    pub service_boundaries: Vec<ServiceBoundaryTransition>,
}

impl ContextLineage {
    pub(crate) fn new(correlation_id: String, origin_message_id: String, start_time: DateTime<Utc>) -> Self {
        Self {
            correlation_id,
            origin_message_id,
            start_time,
            snapshots: Vec::new(),
            service_boundaries: Vec::new(),
        }
    }

    /// Timestamp of the most recent activity on this lineage.
    pub fn last_activity(&self) -> DateTime<Utc> {
        let last_snapshot = self.snapshots.last().map(|s| s.timestamp);
        let last_boundary = self.service_boundaries.last().map(|b| b.timestamp);
        [Some(self.start_time), last_snapshot, last_boundary]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.start_time)
    }

    /// Fraction of boundary crossings marked preserved; 1.0 with no crossings.
    pub fn preservation_rate(&self) -> f64 {
        if self.service_boundaries.is_empty() {
            return 1.0;
        }
        let preserved = self
            .service_boundaries
            .iter()
            .filter(|b| b.context_preserved)
            .count();
        preserved as f64 / self.service_boundaries.len() as f64
    }
}

/// A point where context crossed into another service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBoundaryTransition {
    pub service_name: String,
    pub timestamp: DateTime<Utc>,
    pub trace_parent: Option<String>,
    pub context_preserved: bool,
}

/// Kind of field-level change between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "Added",
            ChangeType::Removed => "Removed",
            ChangeType::Modified => "Modified",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single field-level change between two stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextChange {
    pub field_name: String,
    pub change_type: ChangeType,
    pub from_value: Option<String>,
    pub to_value: Option<String>,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
}

/// A change persisted into a context's mutation history.
pub type ContextMutation = ContextChange;
