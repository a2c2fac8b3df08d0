//! Divergence detection for downloaded entities
//!
//! Decides, per entity, whether the local and server sides diverged since
//! the last confirmed sync. "Changed on the server" means the server's
//! checksum differs from the checksum we last confirmed locally, not from
//! whatever copy happens to be cached.

use crate::change_tracker::SyncedRecord;
use crate::conflict_resolution::{ConflictData, ConflictType};
use crate::entity::SyncEntity;

/// How a downloaded entity relates to local state
#[derive(Debug, Clone, PartialEq)]
pub enum Divergence {
    /// Server content equals the last confirmed sync. Local edits, if any,
    /// are simply newer and stay pending.
    Unchanged,
    /// Local pending edit and server hold identical content
    Converged,
    /// Only the server changed; safe to apply
    ServerOnly,
    /// Both sides changed since the last sync
    Conflict(ConflictData),
}

/// Pairs local and server versions of an entity
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn new() -> Self {
        Self
    }

    /// Classify one downloaded entity.
    ///
    /// `pending_conflict` is the conflict already awaiting review for this
    /// entity; a further server change refreshes it rather than racing it.
    pub fn detect(
        &self,
        server: &SyncEntity,
        local_pending: Option<&SyncEntity>,
        synced: Option<&SyncedRecord>,
        pending_conflict: Option<&ConflictData>,
    ) -> Divergence {
        let server_checksum = server.computed_checksum();
        let server_changed = synced.map_or(true, |record| record.checksum != server_checksum);

        if let Some(existing) = pending_conflict {
            if !server_changed {
                return Divergence::Unchanged;
            }
            // An edit made while the conflict waited is the newest local intent
            let (local_version, local_timestamp) = match local_pending {
                Some(local) => (local.data.clone(), local.timestamp),
                None => (existing.local_version.clone(), existing.local_timestamp),
            };
            let conflict_type = if local_version.is_null() || server.is_tombstone() {
                ConflictType::UpdateDelete
            } else {
                existing.conflict_type
            };
            return Divergence::Conflict(ConflictData::new(
                existing.entity_id.clone(),
                existing.entity_type.clone(),
                existing.base_version.clone(),
                local_version,
                server.data.clone(),
                local_timestamp,
                server.timestamp,
                conflict_type,
            ));
        }

        match local_pending {
            Some(local) if local.checksum == server_checksum => Divergence::Converged,
            Some(_) if !server_changed => Divergence::Unchanged,
            Some(local) => Divergence::Conflict(ConflictData::new(
                local.id.clone(),
                local.entity_type.clone(),
                synced.map(|record| record.data.clone()),
                local.data.clone(),
                server.data.clone(),
                local.timestamp,
                server.timestamp,
                Self::conflict_type(local, server, synced),
            )),
            None if !server_changed => Divergence::Unchanged,
            None => Divergence::ServerOnly,
        }
    }

    fn conflict_type(
        local: &SyncEntity,
        server: &SyncEntity,
        synced: Option<&SyncedRecord>,
    ) -> ConflictType {
        if local.is_tombstone() || server.is_tombstone() {
            ConflictType::UpdateDelete
        } else if synced.is_none() {
            ConflictType::CreateUpdate
        } else {
            ConflictType::UpdateUpdate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn synced(data: serde_json::Value) -> SyncedRecord {
        SyncedRecord {
            entity_type: "medication".to_string(),
            checksum: crate::entity::compute_checksum(&data),
            version: 1,
            data,
            last_synced: Utc::now(),
        }
    }

    fn entity(data: serde_json::Value, version: u64) -> SyncEntity {
        SyncEntity::new("med-1", "medication", data, version)
    }

    #[test]
    fn test_server_only_change() {
        let detector = ConflictDetector::new();
        let record = synced(json!({"dosage": "5mg"}));
        let server = entity(json!({"dosage": "10mg"}), 2);

        assert_eq!(
            detector.detect(&server, None, Some(&record), None),
            Divergence::ServerOnly
        );
    }

    #[test]
    fn test_unchanged_when_checksum_matches_confirmed() {
        let detector = ConflictDetector::new();
        let record = synced(json!({"dosage": "5mg"}));
        let server = entity(json!({"dosage": "5mg"}), 1);
        let local = entity(json!({"dosage": "7mg"}), 2);

        assert_eq!(
            detector.detect(&server, None, Some(&record), None),
            Divergence::Unchanged
        );
        assert_eq!(
            detector.detect(&server, Some(&local), Some(&record), None),
            Divergence::Unchanged
        );
    }

    #[test]
    fn test_both_changed_is_update_update_conflict() {
        let detector = ConflictDetector::new();
        let record = synced(json!({"dosage": "5mg"}));
        let server = entity(json!({"dosage": "10mg"}), 2);
        let local = entity(json!({"dosage": "7mg"}), 2);

        let Divergence::Conflict(conflict) =
            detector.detect(&server, Some(&local), Some(&record), None)
        else {
            panic!("expected conflict");
        };

        assert_eq!(conflict.conflict_type, ConflictType::UpdateUpdate);
        assert_eq!(conflict.base_version, Some(json!({"dosage": "5mg"})));
        assert_eq!(conflict.local_version, json!({"dosage": "7mg"}));
        assert_eq!(conflict.server_version, json!({"dosage": "10mg"}));
    }

    #[test]
    fn test_never_synced_is_create_update_without_base() {
        let detector = ConflictDetector::new();
        let server = entity(json!({"dosage": "10mg"}), 1);
        let local = entity(json!({"dosage": "7mg"}), 1);

        let Divergence::Conflict(conflict) = detector.detect(&server, Some(&local), None, None)
        else {
            panic!("expected conflict");
        };

        assert_eq!(conflict.conflict_type, ConflictType::CreateUpdate);
        assert!(conflict.base_version.is_none());
    }

    #[test]
    fn test_identical_content_converges() {
        let detector = ConflictDetector::new();
        let record = synced(json!({"dosage": "5mg"}));
        let server = entity(json!({"dosage": "10mg"}), 2);
        let local = entity(json!({"dosage": "10mg"}), 2);

        assert_eq!(
            detector.detect(&server, Some(&local), Some(&record), None),
            Divergence::Converged
        );
    }

    #[test]
    fn test_server_deletion_is_update_delete() {
        let detector = ConflictDetector::new();
        let record = synced(json!({"dosage": "5mg"}));
        let server = entity(serde_json::Value::Null, 2);
        let local = entity(json!({"dosage": "7mg"}), 2);

        let Divergence::Conflict(conflict) =
            detector.detect(&server, Some(&local), Some(&record), None)
        else {
            panic!("expected conflict");
        };
        assert_eq!(conflict.conflict_type, ConflictType::UpdateDelete);
    }

    #[test]
    fn test_pending_conflict_is_refreshed_on_new_server_change() {
        let detector = ConflictDetector::new();
        let record = synced(json!({"dosage": "10mg"}));
        let existing = ConflictData::new(
            "med-1",
            "medication",
            Some(json!({"dosage": "5mg"})),
            json!({"dosage": "7mg"}),
            json!({"dosage": "10mg"}),
            Utc::now(),
            Utc::now(),
            ConflictType::UpdateUpdate,
        );
        let server = entity(json!({"dosage": "12mg"}), 3);

        let Divergence::Conflict(refreshed) =
            detector.detect(&server, None, Some(&record), Some(&existing))
        else {
            panic!("expected refreshed conflict");
        };

        assert_ne!(refreshed.id, existing.id);
        assert_eq!(refreshed.local_version, existing.local_version);
        assert_eq!(refreshed.server_version, json!({"dosage": "12mg"}));

        let same_server = entity(json!({"dosage": "10mg"}), 2);
        assert_eq!(
            detector.detect(&same_server, None, Some(&record), Some(&existing)),
            Divergence::Unchanged
        );
    }
}
