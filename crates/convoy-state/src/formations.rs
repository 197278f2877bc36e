//! Formation table: desired state keyed by (app, release).

use std::collections::BTreeMap;

use tracing::debug;

use crate::types::{ExpandedFormation, Formation, FormationKey};

/// Outcome of applying a formation event to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormationChange {
    Added,
    Updated,
    /// Same counts, tags and release as the stored copy.
    Unchanged,
    /// Older than the stored copy; ignored.
    Stale,
}

impl FormationChange {
    /// Whether the change requires reconciliation.
    pub fn is_effective(self) -> bool {
        matches!(self, Self::Added | Self::Updated)
    }
}

/// All formations the scheduler knows about.
///
/// Formations are never removed: a formation that disappears from the
/// controller is scaled to zero so its jobs are stopped.
#[derive(Debug, Default, Clone)]
pub struct FormationTable {
    formations: BTreeMap<FormationKey, Formation>,
}

impl FormationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a formation from the controller.
    pub fn apply(&mut self, ef: ExpandedFormation) -> FormationChange {
        let key = ef.key();
        match self.formations.get_mut(&key) {
            Some(existing) if ef.updated_at < existing.updated_at => {
                debug!(formation = %key, "ignoring stale formation");
                FormationChange::Stale
            }
            Some(existing) => {
                let changed = existing.differs_from(&ef);
                existing.app = ef.app;
                existing.updated_at = ef.updated_at;
                if changed {
                    existing.release = ef.release;
                    existing.processes = ef.processes;
                    existing.tags = ef.tags;
                    FormationChange::Updated
                } else {
                    FormationChange::Unchanged
                }
            }
            None => {
                self.formations.insert(key, Formation::from_expanded(ef));
                FormationChange::Added
            }
        }
    }

    /// Set every desired count of a formation to zero.
    ///
    /// Returns `false` if the formation is unknown or already empty.
    pub fn scale_to_zero(&mut self, key: &FormationKey) -> bool {
        match self.formations.get_mut(key) {
            Some(formation) if !formation.is_empty() => {
                for count in formation.processes.values_mut() {
                    *count = 0;
                }
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &FormationKey) -> Option<&Formation> {
        self.formations.get(key)
    }

    pub fn contains(&self, key: &FormationKey) -> bool {
        self.formations.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &FormationKey> {
        self.formations.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Formation> {
        self.formations.values()
    }

    pub fn len(&self) -> usize {
        self.formations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formations.is_empty()
    }
}
