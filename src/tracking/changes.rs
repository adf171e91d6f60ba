//! Field-level change detection between two snapshots.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::context::{ChangeType, ContextChange, ContextSnapshot};

/// Lazy sequence of changes from one snapshot to another.
///
/// Field names are visited in sorted order; each yields at most one change.
#[derive(Debug)]
pub struct SnapshotChanges {
    pair: Option<(Arc<ContextSnapshot>, Arc<ContextSnapshot>)>,
    names: std::vec::IntoIter<String>,
}

impl SnapshotChanges {
    /// A sequence that yields nothing.
    pub fn empty() -> Self {
        Self {
            pair: None,
            names: Vec::new().into_iter(),
        }
    }

    pub(crate) fn between(from: Arc<ContextSnapshot>, to: Arc<ContextSnapshot>) -> Self {
        let names: BTreeSet<&String> = from.fields.keys().chain(to.fields.keys()).collect();
        let names: Vec<String> = names.into_iter().cloned().collect();
        Self {
            names: names.into_iter(),
            pair: Some((from, to)),
        }
    }
}

impl Iterator for SnapshotChanges {
    type Item = ContextChange;

    fn next(&mut self) -> Option<ContextChange> {
        let (from, to) = self.pair.as_ref()?;
        for name in self.names.by_ref() {
            let before = from.fields.get(&name);
            let after = to.fields.get(&name);

            let change_type = match (before, after) {
                (None, Some(_)) => ChangeType::Added,
                (Some(_), None) => ChangeType::Removed,
                (Some(a), Some(b)) if a != b => ChangeType::Modified,
                _ => continue,
            };

            return Some(ContextChange {
                field_name: name,
                change_type,
                from_value: before.cloned().flatten(),
                to_value: after.cloned().flatten(),
                stage: to.stage.clone(),
                timestamp: to.timestamp,
            });
        }
        None
    }
}

/// Diff two snapshots.
pub fn diff_snapshots(from: &Arc<ContextSnapshot>, to: &Arc<ContextSnapshot>) -> SnapshotChanges {
    SnapshotChanges::between(from.clone(), to.clone())
}
