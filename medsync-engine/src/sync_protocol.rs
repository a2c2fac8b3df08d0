/// Synchronization Protocol
///
/// Contract between the engine and the host's network layer, plus the
/// per-cycle report.
///
/// Protocol flow:
/// 1. Push: upload pending entities in batches, oldest first
/// 2. Pull: download server changes since the last watermark, once
/// 3. Detect: pair local and server versions of each downloaded entity
/// 4. Resolve: auto-resolve or escalate each divergence
///
/// The engine never builds requests itself. Hosts implement
/// [`SyncTransport`] over HTTP, a platform bridge, or an in-process fake.
use crate::conflict_resolution::{ConflictData, Resolution};
use crate::entity::SyncEntity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Network collaborator supplied by the host
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Send one batch. Returns the subset the server confirmed.
    async fn upload(&self, batch: &[SyncEntity]) -> anyhow::Result<Vec<SyncEntity>>;

    /// Fetch server changes since `since`, or everything when `None`
    async fn download(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<SyncEntity>>;
}

/// Outcome of one sync cycle
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Entities the server confirmed
    pub uploaded: Vec<SyncEntity>,

    /// Server changes applied locally
    pub downloaded: Vec<SyncEntity>,

    /// Ids of downloaded entities that carried nothing new
    pub unchanged: Vec<String>,

    /// Divergences detected this cycle
    pub conflicts: Vec<ConflictData>,

    /// One resolution per conflict, same order
    pub resolutions: Vec<Resolution>,

    /// Estimated JSON size of everything sent and received
    pub bytes_transferred: u64,

    pub batches_uploaded: usize,

    pub sync_duration: Duration,
}

impl SyncReport {
    /// Conflicts that were escalated for a user decision
    pub fn escalated(&self) -> impl Iterator<Item = &Resolution> {
        self.resolutions
            .iter()
            .filter(|resolution| resolution.requires_user_review)
    }

    /// Whether the cycle moved any data in either direction
    pub fn is_noop(&self) -> bool {
        self.uploaded.is_empty() && self.downloaded.is_empty() && self.conflicts.is_empty()
    }
}
