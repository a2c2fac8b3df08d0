//! End-to-end sync cycles against an in-process backend

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

mod common;

use chrono::{DateTime, Utc};
use common::{memory_engine, memory_engine_with, FakeBackend};
use medsync_engine::{
    ConflictType, ResolutionStrategy, SyncConfig, SyncConfigUpdate, SyncError, UserChoiceOutcome,
};
use serde_json::json;
use std::sync::Arc;

async fn track_many(engine: &medsync_engine::SyncEngine, count: usize) {
    for i in 0..count {
        engine
            .track_entity_change(&format!("obs-{i}"), "observation", json!({"heartRate": 60 + i}))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_batches_are_ceil_n_over_b() {
    let engine = memory_engine_with(SyncConfig {
        batch_size: 3,
        ..SyncConfig::default()
    })
    .await;
    track_many(&engine, 7).await;

    let backend = FakeBackend::new();
    let report = engine.perform_incremental_sync(&backend).await.unwrap();

    assert_eq!(backend.batch_sizes(), vec![3, 3, 1]);
    assert_eq!(report.batches_uploaded, 3);
    assert_eq!(report.uploaded.len(), 7);
    assert_eq!(engine.pending_changes_count().await, 0);
}

#[tokio::test]
async fn test_second_sync_without_changes_is_a_noop() {
    let engine = memory_engine().await;
    track_many(&engine, 4).await;
    let backend = FakeBackend::new();

    engine.perform_incremental_sync(&backend).await.unwrap();
    let status_before = engine.entity_sync_status("obs-2").await;

    let second = engine.perform_incremental_sync(&backend).await.unwrap();

    assert!(second.is_noop());
    assert_eq!(second.batches_uploaded, 0);
    assert_eq!(backend.batch_sizes().len(), 1);
    assert_eq!(engine.pending_changes_count().await, 0);
    assert_eq!(
        engine.entity_sync_status("obs-2").await.checksum,
        status_before.checksum
    );
}

#[tokio::test]
async fn test_repeat_sync_reports_every_synced_entity_unchanged() {
    let engine = memory_engine().await;
    track_many(&engine, 4).await;
    let backend = FakeBackend::echoing_all();

    engine.perform_incremental_sync(&backend).await.unwrap();
    let second = engine.perform_incremental_sync(&backend).await.unwrap();

    assert!(second.is_noop());
    assert_eq!(second.unchanged.len(), 4);
    assert_eq!(second.unchanged, vec!["obs-0", "obs-1", "obs-2", "obs-3"]);
    assert!(second.resolutions.is_empty());
    assert_eq!(engine.pending_changes_count().await, 0);
}

#[tokio::test]
async fn test_upload_failure_keeps_unsent_batches_pending() {
    let engine = memory_engine_with(SyncConfig {
        batch_size: 3,
        ..SyncConfig::default()
    })
    .await;
    track_many(&engine, 7).await;
    let backend = FakeBackend::failing_from(1);

    let err = engine.perform_incremental_sync(&backend).await.unwrap_err();

    assert!(matches!(err, SyncError::Transport(_)));
    assert!(err.to_string().contains("HTTP 503"));
    assert!(err.is_retryable());
    assert_eq!(engine.pending_changes_count().await, 4);
    assert_eq!(engine.failed_syncs().await.len(), 4);
    assert_eq!(backend.download_calls(), 0);

    let healthy = FakeBackend::new();
    let report = engine.perform_incremental_sync(&healthy).await.unwrap();

    assert_eq!(report.uploaded.len(), 4);
    assert!(engine.failed_syncs().await.is_empty());
}

#[tokio::test]
async fn test_cancel_between_batches() {
    let engine = Arc::new(
        memory_engine_with(SyncConfig {
            batch_size: 2,
            ..SyncConfig::default()
        })
        .await,
    );
    track_many(&engine, 5).await;

    let handle = Arc::clone(&engine);
    let backend = FakeBackend::with_upload_hook(move |_| handle.cancel_sync());

    let result = engine.perform_incremental_sync(&backend).await;

    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(backend.batch_sizes().len(), 1);
    assert_eq!(backend.download_calls(), 0);
    assert_eq!(engine.pending_changes_count().await, 3);
    assert_eq!(engine.failed_syncs().await.len(), 3);

    // The flag is reset at the start of the next cycle
    let report = engine
        .perform_incremental_sync(&FakeBackend::new())
        .await
        .unwrap();
    assert_eq!(report.uploaded.len(), 3);
}

#[tokio::test]
async fn test_concurrent_sync_is_rejected() {
    let engine = memory_engine().await;
    track_many(&engine, 1).await;
    let backend = FakeBackend::yielding();

    let (first, second) = tokio::join!(
        engine.perform_incremental_sync(&backend),
        engine.perform_incremental_sync(&backend)
    );

    let rejected = [&first, &second]
        .iter()
        .filter(|result| matches!(result, Err(SyncError::SyncInProgress)))
        .count();
    assert_eq!(rejected, 1);
    assert!(first.is_ok() || second.is_ok());

    // The guard is released once the winning cycle finishes
    assert!(engine.perform_incremental_sync(&backend).await.is_ok());
}

#[tokio::test]
async fn test_dosage_conflict_round_trip_through_user_choice() {
    let engine = memory_engine().await;
    let backend = FakeBackend::new();

    engine
        .track_entity_change("med-1", "medication", json!({"name": "Warfarin", "dosage": "5mg"}))
        .await
        .unwrap();
    engine.perform_incremental_sync(&backend).await.unwrap();

    engine
        .track_entity_change("med-1", "medication", json!({"name": "Warfarin", "dosage": "7mg"}))
        .await
        .unwrap();
    backend.edit_remotely(
        "med-1",
        "medication",
        json!({"name": "Warfarin", "dosage": "10mg"}),
    );

    let report = engine.perform_incremental_sync(&backend).await.unwrap();

    assert!(report.uploaded.is_empty());
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].conflict_type, ConflictType::UpdateUpdate);
    assert_eq!(
        report.resolutions[0].strategy,
        ResolutionStrategy::MedicationSafetyPriority
    );
    assert!(report.resolutions[0].reasoning.contains("dosage"));
    assert_eq!(
        backend.record("med-1").unwrap().data["dosage"],
        "10mg",
        "server copy must not be overwritten"
    );

    let pending = engine.pending_conflicts().await;
    assert_eq!(pending.len(), 1);

    let outcome = UserChoiceOutcome::from(
        engine
            .resolve_with_user_choice(
                pending[0].id,
                json!({"name": "Warfarin", "dosage": "7mg"}),
                Some("Confirmed with prescriber".to_string()),
            )
            .await,
    );
    assert!(outcome.success);
    assert!(outcome.error.is_none());

    let report = engine.perform_incremental_sync(&backend).await.unwrap();
    assert_eq!(report.uploaded.len(), 1);
    assert_eq!(backend.record("med-1").unwrap().data["dosage"], "7mg");

    let audit = engine.audit_trail(10).await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].entity_id, "med-1");
    assert!(engine.verify_audit_integrity().await);

    let again = UserChoiceOutcome::from(
        engine
            .resolve_with_user_choice(pending[0].id, json!({}), None)
            .await,
    );
    assert!(!again.success);
    assert!(again.error.unwrap().contains("not found"));
}

#[tokio::test]
async fn test_auditing_disabled_still_escalates() {
    let engine = memory_engine_with(SyncConfig {
        auditing_enabled: false,
        ..SyncConfig::default()
    })
    .await;
    let backend = FakeBackend::new();

    engine
        .track_entity_change("note-1", "note", json!({"title": "Log", "body": "ok"}))
        .await
        .unwrap();
    engine
        .track_entity_change("med-1", "medication", json!({"frequency": "daily"}))
        .await
        .unwrap();
    engine.perform_incremental_sync(&backend).await.unwrap();

    engine
        .track_entity_change("note-1", "note", json!({"title": "Morning log", "body": "ok"}))
        .await
        .unwrap();
    engine
        .track_entity_change("med-1", "medication", json!({"frequency": "twice daily"}))
        .await
        .unwrap();
    backend.edit_remotely("note-1", "note", json!({"title": "Log", "body": "dizzy"}));
    backend.edit_remotely("med-1", "medication", json!({"frequency": "weekly"}));

    let report = engine.perform_incremental_sync(&backend).await.unwrap();

    assert_eq!(report.conflicts.len(), 2);
    assert_eq!(report.escalated().count(), 1);
    assert!(engine.audit_trail(10).await.is_empty());

    let pending = engine.pending_conflicts().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entity_id, "med-1");

    // The clean merge is queued and reaches the server next cycle
    engine.perform_incremental_sync(&backend).await.unwrap();
    assert_eq!(
        backend.record("note-1").unwrap().data,
        json!({"title": "Morning log", "body": "dizzy"})
    );

    engine
        .resolve_with_user_choice(pending[0].id, json!({"frequency": "weekly"}), None)
        .await
        .unwrap();
    assert!(engine.audit_trail(10).await.is_empty());
}

#[tokio::test]
async fn test_failed_syncs_can_be_retried() {
    let engine = memory_engine().await;
    track_many(&engine, 2).await;

    assert!(engine
        .perform_incremental_sync(&FakeBackend::failing_from(0))
        .await
        .is_err());

    let failed = engine.failed_syncs().await;
    assert_eq!(failed.len(), 2);
    assert_eq!(failed[0].attempts, 1);
    assert!(failed[0].next_retry_at > failed[0].failed_at);

    assert_eq!(engine.retry_failed_syncs().await.unwrap(), 0);
    assert!(engine.failed_syncs().await.is_empty());

    let report = engine
        .perform_incremental_sync(&FakeBackend::new())
        .await
        .unwrap();
    assert_eq!(report.uploaded.len(), 2);
}

#[tokio::test]
async fn test_modified_entities_since_and_restartable() {
    let engine = memory_engine().await;
    engine
        .track_entity_change("a", "observation", json!({"v": 1}))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let cutoff = Utc::now();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    engine
        .track_entity_change("b", "observation", json!({"v": 2}))
        .await
        .unwrap();

    let all = engine.modified_entities(DateTime::<Utc>::MIN_UTC).await;
    let ids: Vec<&str> = all.iter().map(|entity| entity.id.as_str()).collect();
    let ids_again: Vec<&str> = all.iter().map(|entity| entity.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(ids, ids_again);

    let recent = engine.modified_entities(cutoff).await;
    assert_eq!(recent.len(), 1);
    assert_eq!(recent.into_iter().next().unwrap().id, "b");
}

#[tokio::test]
async fn test_runtime_configuration_update() {
    let engine = memory_engine().await;

    engine
        .update_configuration(SyncConfigUpdate {
            batch_size: Some(2),
            default_strategy: Some("no_such_strategy".to_string()),
            safety_critical_fields: Some(vec![" Allergies ".to_string()]),
            ..SyncConfigUpdate::default()
        })
        .await
        .unwrap();

    let config = engine.configuration().await;
    assert_eq!(config.batch_size, 2);
    assert_eq!(
        config.default_strategy,
        ResolutionStrategy::MedicationSafetyPriority
    );
    assert!(config.safety_critical_fields.contains("allergies"));

    track_many(&engine, 3).await;
    let backend = FakeBackend::new();
    engine.perform_incremental_sync(&backend).await.unwrap();
    assert_eq!(backend.batch_sizes(), vec![2, 1]);
}
