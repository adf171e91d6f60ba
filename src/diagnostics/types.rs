//! Diagnostic records: anomalies, history events and health issues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Kind of heuristically detected context-flow defect.
///
/// Ordinals are stable and used in exports.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyType {
    MissingCorrelation = 0,
    InsufficientContext = 1,
    ExcessiveContext = 2,
    CircularCausation = 3,
    PotentialPii = 4,
    OversizedItem = 5,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::MissingCorrelation => "MissingCorrelation",
            AnomalyType::InsufficientContext => "InsufficientContext",
            AnomalyType::ExcessiveContext => "ExcessiveContext",
            AnomalyType::CircularCausation => "CircularCausation",
            AnomalyType::PotentialPii => "PotentialPII",
            AnomalyType::OversizedItem => "OversizedItem",
        }
    }

    pub fn ordinal(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
}

/// A detected anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextAnomaly {
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    pub description: String,
    pub message_id: String,
    pub detected_at: DateTime<Utc>,
    pub suggested_action: Option<String>,
}

/// One entry in a message's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextHistoryEvent {
    pub event_type: String,
    pub details: Option<String>,
    pub stage: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub thread_id: String,
    pub field_count: usize,
    pub size_bytes: usize,
}

/// Bounded event log for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextHistory {
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    pub events: VecDeque<ContextHistoryEvent>,
}

impl ContextHistory {
    pub(crate) fn new(message_id: String) -> Self {
        Self {
            message_id,
            created_at: Utc::now(),
            events: VecDeque::new(),
        }
    }

    /// Append, dropping the oldest events beyond `max_events`.
    pub(crate) fn push(&mut self, event: ContextHistoryEvent, max_events: usize) {
        self.events.push_back(event);
        while self.events.len() > max_events.max(1) {
            self.events.pop_front();
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.events.back().map_or(self.created_at, |e| e.timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IssueSeverity {
    Information,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueCategory {
    MissingField,
    StaleMessage,
    HighDeliveryCount,
    OversizedContext,
    ValidationFailure,
    AuthorizationFailure,
}

/// A health finding produced by one analysis call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDiagnosticIssue {
    pub severity: IssueSeverity,
    pub category: IssueCategory,
    pub description: String,
    pub field: Option<String>,
    pub recommendation: Option<String>,
}
