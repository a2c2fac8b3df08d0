//! Shared fixtures for integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medsync_engine::{MemoryStateStore, SyncConfig, SyncEngine, SyncEntity, SyncTransport};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type UploadHook = Box<dyn Fn(usize) + Send + Sync>;

/// In-process stand-in for the sync backend.
///
/// Stores whatever is uploaded and serves it back on download, so a second
/// cycle sees its own uploads echoed. An upload whose version does not
/// exceed a different server copy is left unconfirmed, as a real backend
/// would reject a stale write.
#[derive(Default)]
pub struct FakeBackend {
    records: Mutex<BTreeMap<String, SyncEntity>>,
    batch_sizes: Mutex<Vec<usize>>,
    downloads: AtomicUsize,
    fail_from_call: Option<usize>,
    yield_on_upload: bool,
    ignore_watermark: bool,
    on_upload: Option<UploadHook>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upload calls numbered `call` (0-based) and later fail
    pub fn failing_from(call: usize) -> Self {
        Self {
            fail_from_call: Some(call),
            ..Self::default()
        }
    }

    /// Yield to the scheduler inside every upload
    pub fn yielding() -> Self {
        Self {
            yield_on_upload: true,
            ..Self::default()
        }
    }

    /// Serve every stored record on download regardless of `since`
    pub fn echoing_all() -> Self {
        Self {
            ignore_watermark: true,
            ..Self::default()
        }
    }

    /// Run `hook` with the call index after each successful upload
    pub fn with_upload_hook(hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        Self {
            on_upload: Some(Box::new(hook)),
            ..Self::default()
        }
    }

    /// Simulate an edit made on another device
    pub fn edit_remotely(&self, id: &str, entity_type: &str, data: serde_json::Value) {
        let mut records = self.records.lock().unwrap();
        let version = records.get(id).map_or(0, |entity| entity.version) + 1;
        records.insert(
            id.to_string(),
            SyncEntity::new(id, entity_type, data, version),
        );
    }

    pub fn record(&self, id: &str) -> Option<SyncEntity> {
        self.records.lock().unwrap().get(id).cloned()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    pub fn download_calls(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncTransport for FakeBackend {
    async fn upload(&self, batch: &[SyncEntity]) -> anyhow::Result<Vec<SyncEntity>> {
        if self.yield_on_upload {
            tokio::task::yield_now().await;
        }

        let call = {
            let mut sizes = self.batch_sizes.lock().unwrap();
            sizes.push(batch.len());
            sizes.len() - 1
        };

        if self.fail_from_call.is_some_and(|from| call >= from) {
            anyhow::bail!("sync gateway returned HTTP 503");
        }

        // Writes based on a version older than the server's are not confirmed
        let mut confirmed = Vec::new();
        {
            let mut records = self.records.lock().unwrap();
            for entity in batch {
                let stale = records.get(&entity.id).is_some_and(|current| {
                    current.version >= entity.version && current.checksum != entity.checksum
                });
                if !stale {
                    records.insert(entity.id.clone(), entity.clone());
                    confirmed.push(entity.clone());
                }
            }
        }

        if let Some(hook) = &self.on_upload {
            hook(call);
        }

        Ok(confirmed)
    }

    async fn download(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<SyncEntity>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let records = self.records.lock().unwrap();
        Ok(records
            .values()
            .filter(|entity| {
                self.ignore_watermark || since.map_or(true, |since| entity.timestamp >= since)
            })
            .cloned()
            .collect())
    }
}

pub async fn memory_engine() -> SyncEngine {
    memory_engine_with(SyncConfig::default()).await
}

pub async fn memory_engine_with(config: SyncConfig) -> SyncEngine {
    SyncEngine::open(Arc::new(MemoryStateStore::new()), config)
        .await
        .unwrap()
}
