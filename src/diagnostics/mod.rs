//! Context flow diagnostics subsystem.
//!
//! # Data Flow
//! ```text
//! MessageContext ──▶ detect_anomalies ──▶ recent-anomaly ring (bounded)
//!                ──▶ analyze_context_health ──▶ issues (not stored)
//!                ──▶ track_context_history ──▶ per-message history (bounded)
//!
//! tracker snapshots/lineages ──▶ visualize_context_flow / generate_correlation_report
//! histories + anomalies + metrics ──▶ export_diagnostic_data (JSON)
//! ```
//!
//! # Design Decisions
//! - Pulled on demand; nothing in the message path depends on diagnostics
//! - Rules are independent, so one context can raise several anomaly types
//! - PII detection matches item names only, never values

pub mod engine;
pub mod report;
pub mod types;

pub use engine::ContextFlowDiagnostics;
pub use report::{DiagnosticExport, NO_FLOW_DATA, NO_LINEAGE};
pub use types::{
    AnomalySeverity, AnomalyType, ContextAnomaly, ContextDiagnosticIssue, ContextHistory,
    ContextHistoryEvent, IssueCategory, IssueSeverity,
};
