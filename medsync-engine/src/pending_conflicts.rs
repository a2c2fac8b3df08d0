//! Holding area for conflicts awaiting a human decision

use crate::conflict_resolution::ConflictData;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unresolved conflicts, at most one per entity, in detection order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingConflictStore {
    conflicts: Vec<ConflictData>,
}

impl PendingConflictStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a conflict, superseding any older one for the same entity.
    ///
    /// Returns the superseded conflict, if there was one.
    pub fn upsert(&mut self, conflict: ConflictData) -> Option<ConflictData> {
        let superseded = self
            .conflicts
            .iter()
            .position(|existing| existing.entity_id == conflict.entity_id)
            .map(|index| self.conflicts.remove(index));

        if let Some(old) = &superseded {
            tracing::debug!(
                entity_id = %conflict.entity_id,
                superseded = %old.id,
                conflict_id = %conflict.id,
                "Superseded pending conflict"
            );
        }

        self.conflicts.push(conflict);
        superseded
    }

    pub fn get(&self, conflict_id: Uuid) -> Option<&ConflictData> {
        self.conflicts.iter().find(|conflict| conflict.id == conflict_id)
    }

    pub fn for_entity(&self, entity_id: &str) -> Option<&ConflictData> {
        self.conflicts
            .iter()
            .find(|conflict| conflict.entity_id == entity_id)
    }

    pub fn contains_entity(&self, entity_id: &str) -> bool {
        self.for_entity(entity_id).is_some()
    }

    pub fn remove(&mut self, conflict_id: Uuid) -> Option<ConflictData> {
        self.conflicts
            .iter()
            .position(|conflict| conflict.id == conflict_id)
            .map(|index| self.conflicts.remove(index))
    }

    pub fn list(&self) -> Vec<ConflictData> {
        self.conflicts.clone()
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn clear(&mut self) {
        self.conflicts.clear();
    }
}
