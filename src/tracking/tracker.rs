//! Context flow tracker.
//!
//! # Responsibilities
//! - Capture immutable snapshots of a message's context per stage
//! - Stitch snapshots into correlation-keyed lineages
//! - Record service-boundary crossings
//! - Validate required fields and diff stages
//! - Sweep lineages and snapshots past the retention window

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ContextFlowConfig;
use crate::context::message::item_to_string;
use crate::context::{fields, ContextLineage, ContextSnapshot, MessageContext, ServiceBoundaryTransition};
use crate::error::{require_arg, ContextFlowError, ContextFlowResult};
use crate::lifecycle::{spawn_sweeper, CancellationToken};
use crate::observability::metrics::ContextFlowMetrics;
use crate::tracking::changes::SnapshotChanges;

/// A lineage plus a tombstone flag set when the sweeper evicts it.
struct LineageSlot {
    lineage: ContextLineage,
    evicted: bool,
}

type SharedSlot = Arc<Mutex<LineageSlot>>;

struct TrackerState {
    config: Arc<ContextFlowConfig>,
    metrics: Arc<ContextFlowMetrics>,
    lineages: DashMap<String, SharedSlot>,
    snapshots: DashMap<String, Vec<Arc<ContextSnapshot>>>,
    disposed: AtomicBool,
}

/// Records how a message's context evolves across stages and services.
pub struct ContextFlowTracker {
    state: Arc<TrackerState>,
    cancel: CancellationToken,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl ContextFlowTracker {
    /// Create a tracker; starts the retention sweeper when inside a tokio runtime.
    pub fn new(config: Arc<ContextFlowConfig>, metrics: Arc<ContextFlowMetrics>) -> Self {
        let state = Arc::new(TrackerState {
            config,
            metrics,
            lineages: DashMap::new(),
            snapshots: DashMap::new(),
            disposed: AtomicBool::new(false),
        });

        let cancel = CancellationToken::new();
        let weak: Weak<TrackerState> = Arc::downgrade(&state);
        let cleanup = spawn_sweeper(
            "context_tracker",
            state.config.tracker.cleanup_interval(),
            cancel.clone(),
            move || weak.upgrade().map_or(0, |state| state.sweep(Utc::now())),
        );

        Self {
            state,
            cancel,
            cleanup: Mutex::new(cleanup),
        }
    }

    pub fn config(&self) -> &ContextFlowConfig {
        &self.state.config
    }

    pub fn metrics(&self) -> &Arc<ContextFlowMetrics> {
        &self.state.metrics
    }

    /// Capture a snapshot of `context` at `stage`.
    ///
    /// Best-effort: an absent context or blank stage is logged and ignored.
    pub fn record_context_state(
        &self,
        context: Option<&MessageContext>,
        stage: &str,
    ) -> Option<Arc<ContextSnapshot>> {
        self.record_context_state_with_metadata(context, stage, BTreeMap::new())
    }

    /// Capture a snapshot carrying free-form metadata.
    pub fn record_context_state_with_metadata(
        &self,
        context: Option<&MessageContext>,
        stage: &str,
        metadata: BTreeMap<String, String>,
    ) -> Option<Arc<ContextSnapshot>> {
        if self.is_disposed() {
            tracing::debug!(stage, "Tracker disposed, snapshot dropped");
            return None;
        }
        let Some(context) = context else {
            tracing::debug!(stage, "No context supplied, snapshot skipped");
            return None;
        };
        if stage.trim().is_empty() {
            tracing::warn!(message_id = ?context.message_id, "Blank stage name, snapshot skipped");
            return None;
        }

        let message_id = context
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let lineage_key = context
            .lineage_key()
            .map(str::to_string)
            .unwrap_or_else(|| message_id.clone());

        let fields = self.state.capture_fields(context);
        let field_count = fields.values().filter(|v| v.is_some()).count();
        let size_bytes = self.state.estimate_size(&fields);

        let written = self.state.with_lineage(&lineage_key, &message_id, |lineage| {
            let now = Utc::now();
            let timestamp = lineage
                .snapshots
                .last()
                .map_or(now, |last| last.timestamp.max(now));
            let snapshot = Arc::new(ContextSnapshot {
                message_id: message_id.clone(),
                stage: stage.to_string(),
                timestamp,
                fields,
                field_count,
                size_bytes,
                metadata,
            });

            lineage.snapshots.push(snapshot.clone());
            let max = self.state.config.tracker.max_snapshots_per_lineage.max(1);
            if lineage.snapshots.len() > max {
                let excess = lineage.snapshots.len() - max;
                lineage.snapshots.drain(..excess);
            }

            let mut per_message = self.state.snapshots.entry(message_id.clone()).or_default();
            per_message.push(snapshot.clone());
            if per_message.len() > max {
                let excess = per_message.len() - max;
                per_message.drain(..excess);
            }

            (snapshot, lineage.snapshots.len())
        });
        let Some((snapshot, depth)) = written else {
            tracing::debug!(stage, "Tracker disposed mid-write, snapshot dropped");
            return None;
        };

        self.state.metrics.update_lineage_depth(depth);
        self.state.metrics.record_snapshot(stage, field_count, size_bytes);

        tracing::debug!(
            message_id = %message_id,
            lineage = %lineage_key,
            stage,
            field_count,
            size_bytes,
            "Context snapshot recorded"
        );
        Some(snapshot)
    }

    /// Field-level changes between the snapshots recorded at two stages.
    ///
    /// Yields nothing when either stage was never recorded for this message.
    pub fn detect_changes(
        &self,
        context: &MessageContext,
        from_stage: &str,
        to_stage: &str,
    ) -> ContextFlowResult<SnapshotChanges> {
        require_arg(from_stage, "from_stage")?;
        require_arg(to_stage, "to_stage")?;

        let Some(message_id) = context.message_id.as_deref() else {
            return Ok(SnapshotChanges::empty());
        };
        let Some(list) = self.state.snapshots.get(message_id) else {
            return Ok(SnapshotChanges::empty());
        };

        let latest = |stage: &str| list.iter().rev().find(|s| s.stage == stage).cloned();
        match (latest(from_stage), latest(to_stage)) {
            (Some(from), Some(to)) => Ok(SnapshotChanges::between(from, to)),
            _ => Ok(SnapshotChanges::empty()),
        }
    }

    /// Record that `context` crossed into `service_name`.
    pub fn correlate_across_boundary(
        &self,
        context: &MessageContext,
        service_name: &str,
    ) -> ContextFlowResult<ServiceBoundaryTransition> {
        let service_name = require_arg(service_name, "service_name")?;
        let lineage_key = context
            .lineage_key()
            .map(str::to_string)
            .ok_or(ContextFlowError::InvalidArgument { name: "context.message_id" })?;
        let origin = context.message_id.clone().unwrap_or_else(|| lineage_key.clone());

        let transition = ServiceBoundaryTransition {
            service_name: service_name.to_string(),
            timestamp: Utc::now(),
            trace_parent: context.trace_parent.clone(),
            context_preserved: true,
        };

        let recorded = self.state.with_lineage(&lineage_key, &origin, |lineage| {
            lineage.service_boundaries.push(transition.clone());
        });
        if recorded.is_none() {
            tracing::debug!(lineage = %lineage_key, "Tracker disposed, boundary not stored");
        }
        self.state.metrics.record_boundary_crossing(service_name);

        tracing::debug!(
            lineage = %lineage_key,
            service = service_name,
            "Service boundary crossing recorded"
        );
        Ok(transition)
    }

    /// True when every configured required field is present and non-blank.
    pub fn validate_context_integrity(&self, context: &MessageContext) -> bool {
        self.missing_required_fields(context).is_empty()
    }

    /// Required fields that are absent, null or whitespace-only.
    pub fn missing_required_fields(&self, context: &MessageContext) -> Vec<String> {
        self.state
            .config
            .fields
            .required_fields
            .iter()
            .filter(|name| {
                context
                    .resolve_field(name)
                    .map_or(true, |value| value.trim().is_empty())
            })
            .cloned()
            .collect()
    }

    /// A copy of the lineage tracked for `correlation_id`.
    pub fn get_context_lineage(&self, correlation_id: &str) -> Option<ContextLineage> {
        let slot = self.state.lineages.get(correlation_id)?.value().clone();
        let slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(slot.lineage.clone())
    }

    /// Snapshots recorded for `message_id`, oldest first.
    pub fn get_message_snapshots(&self, message_id: &str) -> Vec<Arc<ContextSnapshot>> {
        self.state
            .snapshots
            .get(message_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub fn tracked_message_ids(&self) -> Vec<String> {
        self.state.snapshots.iter().map(|r| r.key().clone()).collect()
    }

    pub fn lineage_count(&self) -> usize {
        self.state.lineages.len()
    }

    /// Evict lineages and snapshot lists idle past the retention window.
    pub fn cleanup_expired(&self) -> usize {
        self.state.sweep(Utc::now())
    }

    /// Evict entries idle since before `now - retention`.
    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        self.state.sweep(now)
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::Acquire)
    }

    /// Stop the sweeper and clear all state. Later calls are no-ops.
    pub fn dispose(&self) {
        if let Some(handle) = self.begin_dispose() {
            handle.abort();
        }
    }

    /// Like [`dispose`](Self::dispose) but waits for the sweeper to exit.
    pub async fn dispose_async(&self) {
        if let Some(handle) = self.begin_dispose() {
            let _ = handle.await;
        }
    }

    fn begin_dispose(&self) -> Option<JoinHandle<()>> {
        if self.state.disposed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.cancel.cancel();
        self.state.release();
        tracing::debug!("Context flow tracker disposed");
        self.cleanup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Drop for ContextFlowTracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl TrackerState {
    /// Run `f` against the lineage for `key`, creating it on first sight.
    ///
    /// Retries when the sweeper evicted the slot between lookup and lock.
    /// Returns `None` once the tracker is disposed.
    fn with_lineage<T>(
        &self,
        key: &str,
        origin_message_id: &str,
        f: impl FnOnce(&mut ContextLineage) -> T,
    ) -> Option<T> {
        loop {
            if self.disposed.load(Ordering::Acquire) {
                return None;
            }
            let slot = self
                .lineages
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(LineageSlot {
                        lineage: ContextLineage::new(key.to_string(), origin_message_id.to_string(), Utc::now()),
                        evicted: false,
                    }))
                })
                .value()
                .clone();

            let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.disposed.load(Ordering::Acquire) {
                drop(guard);
                self.lineages.remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
                return None;
            }
            if guard.evicted {
                continue;
            }
            return Some(f(&mut guard.lineage));
        }
    }

    /// Tombstone every lineage under its own lock, then drop the indexes.
    ///
    /// A writer already holding a slot lock finishes before its slot is
    /// tombstoned, so its per-message entry is gone by the final clear.
    fn release(&self) {
        self.lineages.retain(|_, slot| {
            slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).evicted = true;
            false
        });
        self.snapshots.clear();
    }

    fn capture_fields(&self, context: &MessageContext) -> BTreeMap<String, Option<String>> {
        let mut captured: BTreeMap<String, Option<String>> = fields::ALL
            .iter()
            .map(|name| (name.to_string(), context.well_known(name).flatten()))
            .collect();

        let tracker = &self.config.tracker;
        if tracker.capture_custom_items {
            let tracked = &self.config.fields.tracked_fields;
            let items = context
                .custom_items()
                .filter(|(key, _)| tracked.is_empty() || tracked.iter().any(|t| t == *key))
                .take(tracker.max_custom_items_to_capture);
            for (key, value) in items {
                captured.insert(format!("{}{}", fields::ITEM_PREFIX, key), item_to_string(value));
            }
        }
        captured
    }

    fn estimate_size(&self, fields: &BTreeMap<String, Option<String>>) -> usize {
        let started = Instant::now();
        let size = serde_json::to_vec(fields).map(|v| v.len()).unwrap_or_else(|_| {
            fields
                .iter()
                .map(|(k, v)| k.len() + v.as_ref().map_or(4, String::len) + 6)
                .sum()
        });
        self.metrics
            .record_serialization_latency("snapshot_size_estimate", started.elapsed());
        size
    }

    fn sweep(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.tracker.retention())
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = now - retention;
        let mut removed = 0;

        self.lineages.retain(|_, slot| {
            let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if guard.lineage.last_activity() < cutoff {
                guard.evicted = true;
                removed += 1;
                false
            } else {
                true
            }
        });

        self.snapshots.retain(|_, list| {
            let keep = list.last().is_some_and(|s| s.timestamp >= cutoff);
            if !keep {
                removed += 1;
            }
            keep
        });

        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ChangeType;

    fn tracker_with(config: ContextFlowConfig) -> ContextFlowTracker {
        ContextFlowTracker::new(Arc::new(config), Arc::new(ContextFlowMetrics::new()))
    }

    fn tracker() -> ContextFlowTracker {
        tracker_with(ContextFlowConfig::default())
    }

    #[test]
    fn test_absent_context_is_ignored() {
        let tracker = tracker();
        assert!(tracker.record_context_state(None, "Before").is_none());
        assert_eq!(tracker.lineage_count(), 0);
    }

    #[test]
    fn test_snapshot_captures_fields() {
        let tracker = tracker();
        let ctx = MessageContext::new("m-1")
            .with_correlation_id("c-1")
            .with_item("Region", "eu")
            .with_item(crate::context::STAGE_ITEM_KEY, "Handler");

        let snapshot = tracker.record_context_state(Some(&ctx), "Before").unwrap();
        assert_eq!(snapshot.field("MessageId"), Some("m-1"));
        assert_eq!(snapshot.field("Item.Region"), Some("eu"));
        assert!(!snapshot.fields.contains_key("Item.ContextFlow.Stage"));
        assert!(snapshot.fields.contains_key("TenantId"));
        // MessageId, CorrelationId, DeliveryCount, Item.Region
        assert_eq!(snapshot.field_count, 4);
        assert!(snapshot.size_bytes > 0);

        assert_eq!(tracker.get_message_snapshots("m-1").len(), 1);
        assert_eq!(tracker.get_context_lineage("c-1").unwrap().snapshots.len(), 1);
        assert_eq!(tracker.metrics().get_metrics_summary().total_contexts_processed, 1);
    }

    #[test]
    fn test_custom_item_cap_and_tracked_fields() {
        let mut config = ContextFlowConfig::default();
        config.tracker.max_custom_items_to_capture = 2;
        let tracker = tracker_with(config);
        let ctx = MessageContext::new("m-1")
            .with_item("a", 1)
            .with_item("b", 2)
            .with_item("c", 3);
        let snapshot = tracker.record_context_state(Some(&ctx), "S").unwrap();
        let items = snapshot.fields.keys().filter(|k| k.starts_with("Item.")).count();
        assert_eq!(items, 2);

        let mut config = ContextFlowConfig::default();
        config.fields.tracked_fields = vec!["c".into()];
        let tracker = tracker_with(config);
        let snapshot = tracker.record_context_state(Some(&ctx), "S").unwrap();
        assert!(snapshot.fields.contains_key("Item.c"));
        assert!(!snapshot.fields.contains_key("Item.a"));

        let mut config = ContextFlowConfig::default();
        config.tracker.capture_custom_items = false;
        let tracker = tracker_with(config);
        let snapshot = tracker.record_context_state(Some(&ctx), "S").unwrap();
        assert!(!snapshot.fields.keys().any(|k| k.starts_with("Item.")));
    }

    #[test]
    fn test_lineage_uses_message_id_without_correlation() {
        let tracker = tracker();
        let ctx = MessageContext::new("m-9");
        tracker.record_context_state(Some(&ctx), "Before");
        let lineage = tracker.get_context_lineage("m-9").unwrap();
        assert_eq!(lineage.origin_message_id, "m-9");
    }

    #[test]
    fn test_lineage_is_bounded_and_monotonic() {
        let mut config = ContextFlowConfig::default();
        config.tracker.max_snapshots_per_lineage = 5;
        let tracker = tracker_with(config);

        for i in 0..12 {
            let ctx = MessageContext::new(format!("m-{}", i)).with_correlation_id("c-1");
            tracker.record_context_state(Some(&ctx), &format!("stage-{}", i));
        }

        let lineage = tracker.get_context_lineage("c-1").unwrap();
        assert_eq!(lineage.snapshots.len(), 5);
        assert_eq!(lineage.snapshots[0].stage, "stage-7");
        assert!(lineage
            .snapshots
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(tracker.metrics().get_metrics_summary().max_lineage_depth, 5);
    }

    #[test]
    fn test_detect_changes_between_stages() {
        let tracker = tracker();
        let mut ctx = MessageContext::new("m-1").with_item("X", 1);
        tracker.record_context_state(Some(&ctx), "A");

        ctx.set_item("X", 2);
        ctx.set_item("Y", "added");
        tracker.record_context_state(Some(&ctx), "B");

        let changes: Vec<_> = tracker.detect_changes(&ctx, "A", "B").unwrap().collect();
        assert_eq!(changes.len(), 2);
        let x = changes.iter().find(|c| c.field_name == "Item.X").unwrap();
        assert_eq!(x.change_type, ChangeType::Modified);
        let y = changes.iter().find(|c| c.field_name == "Item.Y").unwrap();
        assert_eq!(y.change_type, ChangeType::Added);

        assert_eq!(tracker.detect_changes(&ctx, "A", "Z").unwrap().count(), 0);
        assert!(tracker.detect_changes(&ctx, "", "B").is_err());
        assert!(tracker.detect_changes(&ctx, "A", "  ").is_err());
    }

    #[test]
    fn test_boundary_crossing() {
        let tracker = tracker();
        let ctx = MessageContext::new("m-1")
            .with_correlation_id("c-1")
            .with_trace_parent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01");

        let transition = tracker.correlate_across_boundary(&ctx, "billing").unwrap();
        assert!(transition.context_preserved);

        let lineage = tracker.get_context_lineage("c-1").unwrap();
        assert_eq!(lineage.service_boundaries.len(), 1);
        assert!(lineage.service_boundaries[0].trace_parent.is_some());
        assert!(tracker.correlate_across_boundary(&ctx, "").is_err());
        assert_eq!(tracker.metrics().get_metrics_summary().total_boundary_crossings, 1);
    }

    #[test]
    fn test_integrity_validation() {
        let mut config = ContextFlowConfig::default();
        config.fields.required_fields = vec!["MessageId".into(), "CorrelationId".into()];
        let tracker = tracker_with(config);

        assert!(!tracker.validate_context_integrity(&MessageContext::new("m-1")));
        assert!(!tracker.validate_context_integrity(&MessageContext::new("m-1").with_correlation_id("   ")));
        assert!(tracker.validate_context_integrity(&MessageContext::new("m-1").with_correlation_id("c-1")));

        let mut config = ContextFlowConfig::default();
        config.fields.required_fields = vec!["Region".into()];
        let tracker = tracker_with(config);
        assert!(tracker.validate_context_integrity(&MessageContext::new("m-1").with_item("Region", "eu")));

        let mut config = ContextFlowConfig::default();
        config.fields.required_fields.clear();
        let tracker = tracker_with(config);
        assert!(tracker.validate_context_integrity(&MessageContext::default()));
    }

    #[test]
    fn test_cleanup_evicts_idle_entries() {
        let tracker = tracker();
        let ctx = MessageContext::new("m-1").with_correlation_id("c-1");
        tracker.record_context_state(Some(&ctx), "Before");

        assert_eq!(tracker.cleanup_expired(), 0);
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(tracker.cleanup_expired_at(later), 2);
        assert!(tracker.get_context_lineage("c-1").is_none());
        assert!(tracker.get_message_snapshots("m-1").is_empty());

        // A fresh write after eviction starts a new lineage.
        tracker.record_context_state(Some(&ctx), "After");
        assert_eq!(tracker.get_context_lineage("c-1").unwrap().snapshots.len(), 1);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let tracker = tracker();
        let ctx = MessageContext::new("m-1");
        tracker.record_context_state(Some(&ctx), "Before");
        tracker.dispose();
        tracker.dispose();
        assert!(tracker.is_disposed());
        assert!(tracker.get_message_snapshots("m-1").is_empty());
        assert!(tracker.record_context_state(Some(&ctx), "After").is_none());
    }

    #[tokio::test]
    async fn test_zero_cleanup_interval_keeps_manual_sweeps() {
        let mut config = ContextFlowConfig::default();
        config.tracker.cleanup_interval_secs = 0;
        let tracker = tracker_with(config);
        assert!(tracker.cleanup.lock().unwrap().is_none());

        let ctx = MessageContext::new("m-1").with_correlation_id("c-1");
        tracker.record_context_state(Some(&ctx), "Before");
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(tracker.cleanup_expired_at(later), 2);
        tracker.dispose_async().await;
    }

    #[test]
    fn test_write_racing_dispose_leaves_no_entries() {
        let tracker = Arc::new(tracker());
        let ctx = MessageContext::new("m-1").with_correlation_id("c-1");
        tracker.record_context_state(Some(&ctx), "Before");

        // Park both the writer and the disposer on the lineage lock.
        let slot = tracker.state.lineages.get("c-1").unwrap().value().clone();
        let held = slot.lock().unwrap();

        let writer = {
            let tracker = tracker.clone();
            let ctx = ctx.clone();
            std::thread::spawn(move || tracker.record_context_state(Some(&ctx), "After"))
        };
        let disposer = {
            let tracker = tracker.clone();
            std::thread::spawn(move || tracker.dispose())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(held);

        writer.join().unwrap();
        disposer.join().unwrap();
        assert!(tracker.is_disposed());
        assert_eq!(tracker.lineage_count(), 0);
        assert!(tracker.tracked_message_ids().is_empty());

        tracker.correlate_across_boundary(&ctx, "billing").unwrap();
        assert_eq!(tracker.lineage_count(), 0);
    }

    #[tokio::test]
    async fn test_dispose_async_is_idempotent() {
        let tracker = tracker();
        tracker.dispose_async().await;
        tracker.dispose_async().await;
        tracker.dispose();
        assert!(tracker.is_disposed());
    }
}
