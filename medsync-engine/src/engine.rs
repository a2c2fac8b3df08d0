//! Sync engine
//!
//! One [`SyncEngine`] per local database, shared by `Arc`. It owns the
//! change tracker, pending conflicts and audit trail behind a single async
//! mutex and persists every mutation through the injected [`StateStore`].

use crate::audit::{AuditEntry, AuditRecord, AuditTrail, SYSTEM_ACTOR, USER_ACTOR};
use crate::change_tracker::{ChangeTracker, EntitySyncStatus, FailedSync, RetryPolicy};
use crate::config::{SyncConfig, SyncConfigUpdate};
use crate::conflict_detection::{ConflictDetector, Divergence};
use crate::conflict_resolution::{ConflictData, ConflictResolver, Resolution, ResolutionStrategy};
use crate::entity::SyncEntity;
use crate::error::{SyncError, SyncResult};
use crate::pending_conflicts::PendingConflictStore;
use crate::state_store::{keys, StateStore};
use crate::sync_protocol::{SyncReport, SyncTransport};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

/// UI-facing result of [`SyncEngine::resolve_with_user_choice`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChoiceOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<SyncResult<()>> for UserChoiceOutcome {
    fn from(result: SyncResult<()>) -> Self {
        match result {
            Ok(()) => Self {
                success: true,
                error: None,
            },
            Err(err) => Self {
                success: false,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Snapshot of pending entities, oldest first. Iterate it as often as needed.
#[derive(Debug, Clone, Default)]
pub struct ModifiedEntities {
    entities: Vec<SyncEntity>,
}

impl ModifiedEntities {
    pub fn iter(&self) -> std::slice::Iter<'_, SyncEntity> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl IntoIterator for ModifiedEntities {
    type Item = SyncEntity;
    type IntoIter = std::vec::IntoIter<SyncEntity>;

    fn into_iter(self) -> Self::IntoIter {
        self.entities.into_iter()
    }
}

impl<'a> IntoIterator for &'a ModifiedEntities {
    type Item = &'a SyncEntity;
    type IntoIter = std::slice::Iter<'a, SyncEntity>;

    fn into_iter(self) -> Self::IntoIter {
        self.entities.iter()
    }
}

#[derive(Clone)]
struct EngineState {
    tracker: ChangeTracker,
    conflicts: PendingConflictStore,
    audit: AuditTrail,
    config: SyncConfig,
    resolver: ConflictResolver,
}

impl EngineState {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_backoff_ms: self.config.retry_backoff_ms,
            max_retries: self.config.max_retries,
        }
    }

    fn record_audit(&mut self, record: AuditRecord) -> Option<AuditEntry> {
        if !self.config.auditing_enabled {
            return None;
        }
        Some(self.audit.append(record, self.config.max_audit_entries))
    }
}

/// Clears the in-flight flag when a cycle ends, however it ends
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> SyncResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SyncError::SyncInProgress)?;
        Ok(Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Offline-first sync engine
pub struct SyncEngine {
    store: Arc<dyn StateStore>,
    state: Mutex<EngineState>,
    detector: ConflictDetector,
    in_flight: AtomicBool,
    cancel_requested: AtomicBool,
}

impl SyncEngine {
    /// Load persisted state from `store` and build an engine.
    ///
    /// A section that fails to deserialize is reset to empty. Store I/O
    /// errors are returned.
    pub async fn open(store: Arc<dyn StateStore>, config: SyncConfig) -> SyncResult<Self> {
        let tracker: ChangeTracker = load_section(store.as_ref(), keys::SYNC_STATE).await?;
        let conflicts: PendingConflictStore =
            load_section(store.as_ref(), keys::PENDING_CONFLICTS).await?;
        let audit: AuditTrail = load_section(store.as_ref(), keys::AUDIT_TRAIL).await?;

        if !audit.verify_integrity() {
            tracing::warn!(entries = audit.len(), "Audit trail failed integrity check on load");
        }

        tracing::info!(
            pending = tracker.pending_count(),
            pending_conflicts = conflicts.len(),
            audit_entries = audit.len(),
            "Opened sync engine"
        );

        let resolver = ConflictResolver::new(&config);
        Ok(Self {
            store,
            state: Mutex::new(EngineState {
                tracker,
                conflicts,
                audit,
                config,
                resolver,
            }),
            detector: ConflictDetector::new(),
            in_flight: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        })
    }

    /// Record a local mutation and persist it.
    ///
    /// Pass `serde_json::Value::Null` as `data` to record a deletion. The
    /// change only becomes pending once it is stored; a failed write leaves
    /// the engine unchanged.
    pub async fn track_entity_change(
        &self,
        id: &str,
        entity_type: &str,
        data: serde_json::Value,
    ) -> SyncResult<SyncEntity> {
        let mut state = self.state.lock().await;
        let mut tracker = state.tracker.clone();
        let entity = tracker.track(id, entity_type, data, Utc::now());
        self.save_section(keys::SYNC_STATE, &tracker).await?;
        state.tracker = tracker;
        Ok(entity)
    }

    /// Pending entities changed at or after `since`, oldest first
    pub async fn modified_entities(&self, since: DateTime<Utc>) -> ModifiedEntities {
        let state = self.state.lock().await;
        let entities = state.tracker.modified_entities(since).cloned().collect();
        ModifiedEntities { entities }
    }

    pub async fn pending_changes_count(&self) -> usize {
        self.state.lock().await.tracker.pending_count()
    }

    /// Run one upload-then-download cycle against `transport`.
    ///
    /// Only one cycle may run at a time; a concurrent call fails with
    /// [`SyncError::SyncInProgress`]. On an upload failure the remaining
    /// entities stay pending, are recorded as failed, and the transport
    /// error is returned.
    pub async fn perform_incremental_sync(
        &self,
        transport: &dyn SyncTransport,
    ) -> SyncResult<SyncReport> {
        let _guard = InFlightGuard::acquire(&self.in_flight)?;
        self.cancel_requested.store(false, Ordering::Release);

        let started = Instant::now();
        let cycle_start = Utc::now();
        let mut report = SyncReport::default();

        let batches = {
            let state = self.state.lock().await;
            let conflicts = &state.conflicts;
            let planned = state
                .tracker
                .plan_batches(state.config.batch_size, |id| conflicts.contains_entity(id));
            planned
        };

        tracing::info!(batches = batches.len(), "Starting incremental sync");

        let mut batches = batches.into_iter();
        while let Some(batch) = batches.next() {
            if self.is_cancelled() {
                let unsent: Vec<SyncEntity> =
                    std::iter::once(batch).chain(batches).flatten().collect();
                self.abandon_cycle(&unsent, "sync cancelled").await;
                return Err(SyncError::Cancelled);
            }

            let confirmed = match transport.upload(&batch).await {
                Ok(confirmed) => confirmed,
                Err(err) => {
                    let unsent: Vec<SyncEntity> =
                        std::iter::once(batch).chain(batches).flatten().collect();
                    self.abandon_cycle(&unsent, &format!("{err:#}")).await;
                    return Err(SyncError::Transport(err));
                }
            };

            let mut state = self.state.lock().await;
            let accepted = state.tracker.confirm_uploaded(&batch, &confirmed, Utc::now());
            self.save_section(keys::SYNC_STATE, &state.tracker).await?;
            drop(state);

            tracing::debug!(
                sent = batch.len(),
                confirmed = accepted.len(),
                "Uploaded batch"
            );

            report.bytes_transferred += batch.iter().map(SyncEntity::estimated_size).sum::<u64>();
            report.batches_uploaded += 1;
            report.uploaded.extend(accepted);
        }

        if self.is_cancelled() {
            tracing::info!("Sync cancelled before download");
            return Err(SyncError::Cancelled);
        }

        let since = self.state.lock().await.tracker.watermark();
        let server_changes = transport.download(since).await.map_err(SyncError::Transport)?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.apply_server_changes(state, server_changes, &mut report);

        state.tracker.set_watermark(cycle_start);
        self.save_section(keys::SYNC_STATE, &state.tracker).await?;
        self.save_section(keys::PENDING_CONFLICTS, &state.conflicts).await?;
        if !report.resolutions.is_empty() {
            self.save_section(keys::AUDIT_TRAIL, &state.audit).await?;
        }
        drop(guard);

        report.sync_duration = started.elapsed();

        tracing::info!(
            uploaded = report.uploaded.len(),
            downloaded = report.downloaded.len(),
            unchanged = report.unchanged.len(),
            conflicts = report.conflicts.len(),
            escalated = report.escalated().count(),
            bytes = report.bytes_transferred,
            duration_ms = u64::try_from(report.sync_duration.as_millis()).unwrap_or(u64::MAX),
            "Completed incremental sync"
        );

        Ok(report)
    }

    /// Ask a running cycle to stop at the next batch boundary
    pub fn cancel_sync(&self) {
        if self.in_flight.load(Ordering::Acquire) {
            tracing::info!("Sync cancellation requested");
        }
        self.cancel_requested.store(true, Ordering::Release);
    }

    /// Resolve a conflict with the configured policy. Nothing is persisted.
    pub async fn resolve_conflict(&self, conflict: &ConflictData) -> Resolution {
        self.state.lock().await.resolver.resolve(conflict)
    }

    /// Resolve each conflict independently, preserving order
    pub async fn resolve_conflicts(&self, conflicts: &[ConflictData]) -> Vec<Resolution> {
        self.state.lock().await.resolver.resolve_all(conflicts)
    }

    /// Apply a person's decision to a pending conflict.
    ///
    /// The chosen data is queued as a local change and uploaded next cycle.
    /// Nothing changes unless every affected section is stored.
    pub async fn resolve_with_user_choice(
        &self,
        conflict_id: Uuid,
        chosen_data: serde_json::Value,
        rationale: Option<String>,
    ) -> SyncResult<()> {
        let mut guard = self.state.lock().await;
        let mut draft = guard.clone();

        let conflict = draft
            .conflicts
            .remove(conflict_id)
            .ok_or_else(|| SyncError::NotFound(format!("conflict {conflict_id} not found")))?;

        let audited = draft.record_audit(AuditRecord {
            conflict_id,
            entity_id: conflict.entity_id.clone(),
            strategy: ResolutionStrategy::UserChoice,
            local_data: conflict.local_version.clone(),
            server_data: conflict.server_version.clone(),
            resolved_data: chosen_data.clone(),
            resolved_by: USER_ACTOR.to_string(),
            rationale,
        });

        draft
            .tracker
            .track(&conflict.entity_id, &conflict.entity_type, chosen_data, Utc::now());

        self.save_section(keys::PENDING_CONFLICTS, &draft.conflicts).await?;
        self.save_section(keys::SYNC_STATE, &draft.tracker).await?;
        if audited.is_some() {
            self.save_section(keys::AUDIT_TRAIL, &draft.audit).await?;
        }
        *guard = draft;

        tracing::info!(
            conflict_id = %conflict_id,
            entity_id = %conflict.entity_id,
            "Applied user conflict choice"
        );

        Ok(())
    }

    pub async fn pending_conflicts(&self) -> Vec<ConflictData> {
        self.state.lock().await.conflicts.list()
    }

    /// Most recent audit entries first, at most `limit`
    pub async fn audit_trail(&self, limit: usize) -> Vec<AuditEntry> {
        self.state.lock().await.audit.recent(limit)
    }

    pub async fn verify_audit_integrity(&self) -> bool {
        self.state.lock().await.audit.verify_integrity()
    }

    pub async fn entity_sync_status(&self, id: &str) -> EntitySyncStatus {
        self.state.lock().await.tracker.status(id)
    }

    pub async fn failed_syncs(&self) -> Vec<FailedSync> {
        self.state.lock().await.tracker.failed_syncs().to_vec()
    }

    /// Requeue failed entities and clear the failed list.
    ///
    /// Returns how many entities were put back into the pending set.
    pub async fn retry_failed_syncs(&self) -> SyncResult<usize> {
        let mut state = self.state.lock().await;
        let mut tracker = state.tracker.clone();
        let restored = tracker.retry_failed();
        self.save_section(keys::SYNC_STATE, &tracker).await?;
        state.tracker = tracker;

        tracing::info!(restored, "Requeued failed syncs");
        Ok(restored)
    }

    /// Merge `update` into the running configuration. Invalid values are
    /// rejected and leave the configuration untouched.
    pub async fn update_configuration(&self, update: SyncConfigUpdate) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        state.config.apply(update)?;
        state.resolver = ConflictResolver::new(&state.config);

        tracing::info!(
            batch_size = state.config.batch_size,
            default_strategy = state.config.default_strategy.as_str(),
            safety_priority_enabled = state.config.safety_priority_enabled,
            auditing_enabled = state.config.auditing_enabled,
            "Updated sync configuration"
        );
        Ok(())
    }

    pub async fn configuration(&self) -> SyncConfig {
        self.state.lock().await.config.clone()
    }

    /// Forget pending changes, synced records, failures and pending
    /// conflicts. The audit trail is kept.
    pub async fn clear_sync_state(&self) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        state.tracker.clear();
        state.conflicts.clear();

        self.store.remove(keys::SYNC_STATE).await?;
        self.store.remove(keys::PENDING_CONFLICTS).await?;

        tracing::info!("Cleared sync state");
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Classify, resolve and apply one download
    fn apply_server_changes(
        &self,
        state: &mut EngineState,
        server_changes: Vec<SyncEntity>,
        report: &mut SyncReport,
    ) {
        let now = Utc::now();

        for server in server_changes {
            report.bytes_transferred += server.estimated_size();

            let divergence = self.detector.detect(
                &server,
                state.tracker.pending(&server.id),
                state.tracker.synced(&server.id),
                state.conflicts.for_entity(&server.id),
            );

            match divergence {
                Divergence::Unchanged => report.unchanged.push(server.id),
                Divergence::Converged => {
                    state.tracker.accept_server(&server, now);
                    report.unchanged.push(server.id);
                }
                Divergence::ServerOnly => {
                    state.tracker.accept_server(&server, now);
                    report.downloaded.push(server);
                }
                Divergence::Conflict(conflict) => {
                    let resolution = state.resolver.resolve(&conflict);
                    Self::settle_conflict(state, &conflict, &resolution, &server, now);
                    report.conflicts.push(conflict);
                    report.resolutions.push(resolution);
                }
            }
        }
    }

    fn settle_conflict(
        state: &mut EngineState,
        conflict: &ConflictData,
        resolution: &Resolution,
        server: &SyncEntity,
        now: DateTime<Utc>,
    ) {
        // The server copy becomes the confirmed base either way; the local
        // edit lives on in the conflict or in the resolved data.
        state.tracker.accept_server(server, now);

        if resolution.requires_user_review {
            state.conflicts.upsert(conflict.clone());
            tracing::warn!(
                conflict_id = %conflict.id,
                entity_id = %conflict.entity_id,
                conflict_type = conflict.conflict_type.as_str(),
                confidence = resolution.confidence,
                "Conflict escalated for user review"
            );
            return;
        }

        if let Some(stale) = state.conflicts.for_entity(&conflict.entity_id).map(|c| c.id) {
            state.conflicts.remove(stale);
        }

        state.record_audit(AuditRecord {
            conflict_id: conflict.id,
            entity_id: conflict.entity_id.clone(),
            strategy: resolution.strategy,
            local_data: conflict.local_version.clone(),
            server_data: conflict.server_version.clone(),
            resolved_data: resolution.resolved_data.clone(),
            resolved_by: SYSTEM_ACTOR.to_string(),
            rationale: Some(resolution.reasoning.clone()),
        });

        if resolution.resolved_data != server.data {
            state.tracker.track(
                &conflict.entity_id,
                &conflict.entity_type,
                resolution.resolved_data.clone(),
                now,
            );
        }
    }

    /// Record unsent entities as failed; they stay pending
    async fn abandon_cycle(&self, unsent: &[SyncEntity], error: &str) {
        let mut state = self.state.lock().await;
        let policy = state.retry_policy();
        state.tracker.record_failures(unsent, error, Utc::now(), policy);

        if let Err(persist_err) = self.save_section(keys::SYNC_STATE, &state.tracker).await {
            tracing::error!(error = %persist_err, "Failed to persist sync state after aborted cycle");
        }
    }

    async fn save_section<T: Serialize>(&self, key: &str, value: &T) -> SyncResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.store.set(key, bytes).await
    }
}

async fn load_section<T>(store: &dyn StateStore, key: &str) -> SyncResult<T>
where
    T: DeserializeOwned + Default,
{
    let Some(bytes) = store.get(key).await? else {
        return Ok(T::default());
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!(key, error = %e, "Corrupted persisted state, resetting section");
            Ok(T::default())
        }
    }
}
