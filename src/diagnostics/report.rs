//! Human-readable flow diagrams, correlation reports and JSON export.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

use crate::context::ChangeType;
use crate::diagnostics::engine::ContextFlowDiagnostics;
use crate::diagnostics::types::{ContextAnomaly, ContextHistory};
use crate::error::ContextFlowResult;
use crate::observability::metrics::ContextMetricsSummary;
use crate::tracking::diff_snapshots;

/// Returned by [`ContextFlowDiagnostics::visualize_context_flow`] with no snapshots.
pub const NO_FLOW_DATA: &str = "No context flow data available.";

/// Returned by [`ContextFlowDiagnostics::generate_correlation_report`] for unknown ids.
pub const NO_LINEAGE: &str = "No lineage found for correlation id.";

/// Structured diagnostic export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticExport {
    pub exported_at: DateTime<Utc>,
    pub message_id: Option<String>,
    pub histories: BTreeMap<String, ContextHistory>,
    pub recent_anomalies: Vec<ContextAnomaly>,
    pub metrics: ContextMetricsSummary,
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn show(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("null")
}

impl ContextFlowDiagnostics {
    /// Stage-by-stage diagram of the snapshots recorded for `message_id`.
    pub fn visualize_context_flow(&self, message_id: &str) -> String {
        let snapshots = self.tracker.get_message_snapshots(message_id);
        let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) else {
            return NO_FLOW_DATA.to_string();
        };

        let mut out = format!("Context Flow: {}\n", message_id);
        out.push_str(&"=".repeat(out.len() - 1));
        out.push('\n');

        for (index, snapshot) in snapshots.iter().enumerate() {
            out.push_str(&format!(
                "[{}] {} @ {} ({} fields, {} bytes)\n",
                index + 1,
                snapshot.stage,
                ts(snapshot.timestamp),
                snapshot.field_count,
                snapshot.size_bytes
            ));

            if index == 0 {
                continue;
            }
            let changes: Vec<_> = diff_snapshots(&snapshots[index - 1], snapshot).collect();
            if changes.is_empty() {
                out.push_str("    (no changes)\n");
            }
            for change in changes {
                let line = match change.change_type {
                    ChangeType::Added => format!("    + {} = {}", change.field_name, show(&change.to_value)),
                    ChangeType::Removed => format!("    - {} (was {})", change.field_name, show(&change.from_value)),
                    ChangeType::Modified => format!(
                        "    ~ {}: {} -> {}",
                        change.field_name,
                        show(&change.from_value),
                        show(&change.to_value)
                    ),
                };
                out.push_str(&line);
                out.push('\n');
            }
        }

        out.push_str(&format!(
            "Summary: {} stages, fields {} -> {}\n",
            snapshots.len(),
            first.field_count,
            last.field_count
        ));
        out
    }

    /// Origin, stage progression and boundary table for a correlation id.
    pub fn generate_correlation_report(&self, correlation_id: &str) -> String {
        let Some(lineage) = self.tracker.get_context_lineage(correlation_id) else {
            return NO_LINEAGE.to_string();
        };

        let mut out = format!("Correlation Report: {}\n", correlation_id);
        out.push_str(&format!("Origin message: {}\n", lineage.origin_message_id));
        out.push_str(&format!("Started: {}\n", ts(lineage.start_time)));
        out.push_str(&format!("Snapshots: {}\n", lineage.snapshots.len()));

        let stages: Vec<&str> = lineage.snapshots.iter().map(|s| s.stage.as_str()).collect();
        if stages.is_empty() {
            out.push_str("Stage progression: (none)\n");
        } else {
            out.push_str(&format!("Stage progression: {}\n", stages.join(" -> ")));
        }

        out.push_str(&format!("Service boundaries: {}\n", lineage.service_boundaries.len()));
        if !lineage.service_boundaries.is_empty() {
            let width = lineage
                .service_boundaries
                .iter()
                .map(|b| b.service_name.len())
                .max()
                .unwrap_or(0)
                .max("Service".len());
            out.push_str(&format!("  | {:<width$} | {:<24} | {:<9} |\n", "Service", "Timestamp", "Status"));
            for boundary in &lineage.service_boundaries {
                let status = if boundary.context_preserved { "Preserved" } else { "Lost" };
                out.push_str(&format!(
                    "  | {:<width$} | {:<24} | {:<9} |\n",
                    boundary.service_name,
                    ts(boundary.timestamp),
                    status
                ));
            }
        }

        out.push_str(&format!("Preservation rate: {:.1}%\n", lineage.preservation_rate() * 100.0));
        out
    }

    /// Serialize histories, recent anomalies and the metrics summary to JSON.
    ///
    /// With `message_id`, only that message's history is included.
    pub fn export_diagnostic_data(&self, message_id: Option<&str>) -> ContextFlowResult<String> {
        let histories: BTreeMap<String, ContextHistory> = match message_id {
            Some(id) => self
                .get_context_history(id)
                .map(|h| (id.to_string(), h))
                .into_iter()
                .collect(),
            None => self
                .histories
                .iter()
                .map(|r| (r.key().clone(), r.value().clone()))
                .collect(),
        };

        let export = DiagnosticExport {
            exported_at: Utc::now(),
            message_id: message_id.map(str::to_string),
            histories,
            recent_anomalies: self.get_recent_anomalies(self.config.diagnostics.max_anomaly_queue_size),
            metrics: self.metrics.get_metrics_summary(),
        };

        let started = Instant::now();
        let json = serde_json::to_string_pretty(&export)?;
        self.metrics
            .record_serialization_latency("diagnostic_export", started.elapsed());
        Ok(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextFlowConfig;
    use crate::context::MessageContext;
    use crate::observability::metrics::ContextFlowMetrics;
    use crate::tracking::ContextFlowTracker;
    use std::sync::Arc;

    fn diagnostics() -> ContextFlowDiagnostics {
        let config = Arc::new(ContextFlowConfig::default());
        let metrics = Arc::new(ContextFlowMetrics::new());
        let tracker = Arc::new(ContextFlowTracker::new(config.clone(), metrics.clone()));
        ContextFlowDiagnostics::new(tracker, metrics, config)
    }

    #[test]
    fn test_visualize_lists_changes() {
        let d = diagnostics();
        let mut ctx = MessageContext::new("m-1").with_item("X", 1).with_item("Z", "z");
        d.tracker().record_context_state(Some(&ctx), "Before");

        ctx.set_item("X", 2);
        ctx.set_item("Y", "added");
        ctx.items.remove("Z");
        d.tracker().record_context_state(Some(&ctx), "After");

        let text = d.visualize_context_flow("m-1");
        assert!(text.starts_with("Context Flow: m-1"));
        assert!(text.contains("[1] Before"));
        assert!(text.contains("[2] After"));
        assert!(text.contains("+ Item.Y = added"));
        assert!(text.contains("- Item.Z (was z)"));
        assert!(text.contains("~ Item.X: 1 -> 2"));
        assert!(text.contains("Summary: 2 stages, fields 4 -> 4"));
    }

    #[test]
    fn test_visualize_without_data() {
        assert_eq!(diagnostics().visualize_context_flow("nope"), NO_FLOW_DATA);
    }

    #[test]
    fn test_correlation_report() {
        let d = diagnostics();
        let ctx = MessageContext::new("m-1").with_correlation_id("c-1");
        d.tracker().record_context_state(Some(&ctx), "Before");
        d.tracker().record_context_state(Some(&ctx), "After");
        d.tracker().correlate_across_boundary(&ctx, "billing").unwrap();

        let report = d.generate_correlation_report("c-1");
        assert!(report.contains("Origin message: m-1"));
        assert!(report.contains("Snapshots: 2"));
        assert!(report.contains("Stage progression: Before -> After"));
        assert!(report.contains("billing"));
        assert!(report.contains("Preserved"));
        assert!(report.contains("Preservation rate: 100.0%"));

        assert_eq!(d.generate_correlation_report("c-unknown"), NO_LINEAGE);
    }

    #[test]
    fn test_export_round_trips() {
        let d = diagnostics();
        let ctx = MessageContext::new("m-1").with_causation_id("m-1");
        d.track_context_history(&ctx, "received", Some("from queue")).unwrap();
        d.track_context_history(&MessageContext::new("m-2"), "received", None).unwrap();
        d.detect_anomalies(&ctx);

        let json = d.export_diagnostic_data(None).unwrap();
        let export: DiagnosticExport = serde_json::from_str(&json).unwrap();
        assert_eq!(export.histories.len(), 2);
        assert!(!export.recent_anomalies.is_empty());
        assert!(export.message_id.is_none());

        let json = d.export_diagnostic_data(Some("m-1")).unwrap();
        let export: DiagnosticExport = serde_json::from_str(&json).unwrap();
        assert_eq!(export.histories.len(), 1);
        assert_eq!(export.histories["m-1"].events[0].details.as_deref(), Some("from queue"));
        assert_eq!(export.message_id.as_deref(), Some("m-1"));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        for key in ["histories", "recent_anomalies", "metrics"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
    }
}
