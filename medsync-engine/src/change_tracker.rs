//! Local change tracking
//!
//! Provides:
//! - Pending (unsynced) edits keyed by entity id, collapsing repeated edits
//! - Per-id version counters that never go backwards, even across syncs
//! - The last locally confirmed checksum of every synced entity
//! - Failed upload bookkeeping with exponential backoff

use crate::entity::SyncEntity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Last confirmed sync of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedRecord {
    pub entity_type: String,
    pub checksum: String,
    pub version: u64,
    /// Common ancestor offered to three-way merge
    pub data: serde_json::Value,
    pub last_synced: DateTime<Utc>,
}

/// An entity whose upload failed or was cancelled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedSync {
    pub entity: SyncEntity,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
}

/// Backoff policy for failed uploads
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_backoff_ms: u64,
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Delay before attempt `attempts + 1`: `base * 2^(attempts - 1)`,
    /// doubling at most `max_retries` times.
    pub fn backoff(&self, attempts: u32) -> chrono::Duration {
        let doublings = attempts.saturating_sub(1).min(self.max_retries).min(32);
        let millis = self.base_backoff_ms.saturating_mul(1_u64 << doublings);
        chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX))
    }
}

/// Diagnostic view of one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySyncStatus {
    pub has_pending_changes: bool,
    pub last_synced: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    pub version: u64,
}

/// Persisted form of the tracker (`sync_state` key)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeTracker {
    pending: BTreeMap<String, SyncEntity>,
    synced: BTreeMap<String, SyncedRecord>,
    watermark: Option<DateTime<Utc>>,
    #[serde(default)]
    failed: Vec<FailedSync>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local mutation.
    ///
    /// Repeated edits to a pending id are collapsed into one entry. The
    /// version is always one past the highest version seen for the id.
    pub fn track(
        &mut self,
        id: &str,
        entity_type: &str,
        data: serde_json::Value,
        now: DateTime<Utc>,
    ) -> SyncEntity {
        let version = self.current_version(id) + 1;
        let entity = SyncEntity::with_timestamp(id, entity_type, data, version, now);

        self.pending.insert(id.to_string(), entity.clone());

        tracing::debug!(
            entity_id = id,
            entity_type,
            version,
            "Tracked entity change"
        );

        entity
    }

    /// Highest version known locally for `id`, 0 if never seen
    pub fn current_version(&self, id: &str) -> u64 {
        let pending = self.pending.get(id).map_or(0, |entity| entity.version);
        let synced = self.synced.get(id).map_or(0, |record| record.version);
        pending.max(synced)
    }

    /// Pending entities changed at or after `since`, oldest first.
    ///
    /// The returned iterator is cloneable, so callers can restart it.
    pub fn modified_entities(
        &self,
        since: DateTime<Utc>,
    ) -> impl Iterator<Item = &SyncEntity> + Clone + '_ {
        let mut entities: Vec<&SyncEntity> = self
            .pending
            .values()
            .filter(|entity| entity.timestamp >= since)
            .collect();
        entities.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        entities.into_iter()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, id: &str) -> Option<&SyncEntity> {
        self.pending.get(id)
    }

    pub fn synced(&self, id: &str) -> Option<&SyncedRecord> {
        self.synced.get(id)
    }

    pub fn status(&self, id: &str) -> EntitySyncStatus {
        let pending = self.pending.get(id);
        let synced = self.synced.get(id);

        EntitySyncStatus {
            has_pending_changes: pending.is_some(),
            last_synced: synced.map(|record| record.last_synced),
            checksum: pending
                .map(|entity| entity.checksum.clone())
                .or_else(|| synced.map(|record| record.checksum.clone())),
            version: self.current_version(id),
        }
    }

    /// Split pending entities into upload batches of at most `batch_size`,
    /// oldest first. Entities for which `hold_back` returns true are skipped.
    pub fn plan_batches(
        &self,
        batch_size: usize,
        hold_back: impl Fn(&str) -> bool,
    ) -> Vec<Vec<SyncEntity>> {
        let ready: Vec<SyncEntity> = self
            .modified_entities(DateTime::<Utc>::MIN_UTC)
            .filter(|entity| !hold_back(&entity.id))
            .cloned()
            .collect();

        ready
            .chunks(batch_size.max(1))
            .map(<[SyncEntity]>::to_vec)
            .collect()
    }

    /// Apply a successful upload.
    ///
    /// Only entities present in both `sent` and `confirmed` are treated as
    /// accepted. The recorded checksum is the one we sent. A pending entry
    /// that was edited again while the batch was in flight is kept.
    pub fn confirm_uploaded(
        &mut self,
        sent: &[SyncEntity],
        confirmed: &[SyncEntity],
        now: DateTime<Utc>,
    ) -> Vec<SyncEntity> {
        let mut accepted = Vec::new();

        for entity in sent {
            if !confirmed.iter().any(|c| c.id == entity.id) {
                tracing::warn!(
                    entity_id = %entity.id,
                    version = entity.version,
                    "Upload not confirmed by server, keeping change pending"
                );
                continue;
            }

            self.record_synced(entity, now);

            let edited_in_flight = self
                .pending
                .get(&entity.id)
                .is_some_and(|pending| pending.version > entity.version);
            if !edited_in_flight {
                self.pending.remove(&entity.id);
            }
            self.failed.retain(|failed| failed.entity.id != entity.id);

            accepted.push(entity.clone());
        }

        accepted
    }

    /// Remember `entity` as the last confirmed state of its id
    pub fn record_synced(&mut self, entity: &SyncEntity, now: DateTime<Utc>) {
        let previous = self.synced.get(&entity.id).map_or(0, |record| record.version);
        let version = entity.version.max(previous);
        self.synced.insert(
            entity.id.clone(),
            SyncedRecord {
                entity_type: entity.entity_type.clone(),
                checksum: entity.computed_checksum(),
                version,
                data: entity.data.clone(),
                last_synced: now,
            },
        );
    }

    /// Take server content as the confirmed state of its id, dropping any
    /// pending edit. The recorded version never falls below what was seen
    /// locally, pending edits included.
    pub fn accept_server(&mut self, server: &SyncEntity, now: DateTime<Utc>) -> Option<SyncEntity> {
        let floor = self.current_version(&server.id);
        let dropped = self.pending.remove(&server.id);

        let mut confirmed = server.clone();
        confirmed.version = server.version.max(floor);
        self.record_synced(&confirmed, now);

        dropped
    }

    pub fn remove_pending(&mut self, id: &str) -> Option<SyncEntity> {
        self.pending.remove(id)
    }

    /// Record entities from a failed or cancelled batch. They stay pending.
    pub fn record_failures(
        &mut self,
        entities: &[SyncEntity],
        error: &str,
        now: DateTime<Utc>,
        policy: RetryPolicy,
    ) {
        for entity in entities {
            let attempts = self
                .failed
                .iter()
                .find(|failed| failed.entity.id == entity.id)
                .map_or(0, |failed| failed.attempts)
                .saturating_add(1);

            self.failed.retain(|failed| failed.entity.id != entity.id);
            self.failed.push(FailedSync {
                entity: entity.clone(),
                error: error.to_string(),
                failed_at: now,
                attempts,
                next_retry_at: now + policy.backoff(attempts),
            });
        }

        tracing::warn!(
            count = entities.len(),
            error,
            "Recorded failed sync entities"
        );
    }

    pub fn failed_syncs(&self) -> &[FailedSync] {
        &self.failed
    }

    /// Move failed entities back into the pending set and clear the list.
    ///
    /// An entity is only re-inserted when nothing newer exists locally.
    /// Returns how many entities were re-inserted.
    pub fn retry_failed(&mut self) -> usize {
        let failed = std::mem::take(&mut self.failed);
        let mut restored = 0;

        for record in failed {
            let id = record.entity.id.clone();
            if self.pending.contains_key(&id) {
                continue;
            }
            if self.synced.get(&id).map_or(0, |synced| synced.version) >= record.entity.version {
                continue;
            }
            self.pending.insert(id, record.entity);
            restored += 1;
        }

        restored
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    pub fn set_watermark(&mut self, watermark: DateTime<Utc>) {
        self.watermark = Some(watermark);
    }

    /// Forget everything, including versions
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
