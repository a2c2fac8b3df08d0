//! Conflict Resolution Audit Trail
//!
//! Records how every conflict touching health data was resolved, and by
//! whom.
//!
//! # Security Features
//!
//! - Append-only: entries are never updated once written
//! - SHA-256 hash chain for tamper detection
//! - Bounded retention; the chain stays verifiable after the oldest entries
//!   are dropped because verification starts from the first retained link

use crate::conflict_resolution::ResolutionStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use uuid::Uuid;

/// Hash used as `prev_hash` for the first entry ever written
pub const GENESIS_HASH: &str = "0";

/// Actor recorded for resolutions made without human input
pub const SYSTEM_ACTOR: &str = "system";

/// Actor recorded when a person picked the resolved data
pub const USER_ACTOR: &str = "user";

/// Audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Unique audit entry ID
    pub id: Uuid,

    /// Conflict that was resolved
    pub conflict_id: Uuid,

    pub entity_id: String,

    pub strategy: ResolutionStrategy,

    pub local_data: serde_json::Value,

    pub server_data: serde_json::Value,

    pub resolved_data: serde_json::Value,

    pub timestamp: DateTime<Utc>,

    /// User ID, or "system" for automatic resolutions
    pub resolved_by: String,

    /// Free-text justification supplied by the resolver
    pub rationale: Option<String>,

    /// Hash of previous audit entry (for tamper detection)
    pub prev_hash: String,

    /// Hash of this entry
    pub entry_hash: String,
}

/// Everything needed to append an entry; hashing happens on append
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub conflict_id: Uuid,
    pub entity_id: String,
    pub strategy: ResolutionStrategy,
    pub local_data: serde_json::Value,
    pub server_data: serde_json::Value,
    pub resolved_data: serde_json::Value,
    pub resolved_by: String,
    pub rationale: Option<String>,
}

impl AuditEntry {
    fn from_record(record: AuditRecord, prev_hash: String) -> Self {
        let mut entry = Self {
            id: Uuid::new_v4(),
            conflict_id: record.conflict_id,
            entity_id: record.entity_id,
            strategy: record.strategy,
            local_data: record.local_data,
            server_data: record.server_data,
            resolved_data: record.resolved_data,
            timestamp: Utc::now(),
            resolved_by: record.resolved_by,
            rationale: record.rationale,
            prev_hash,
            entry_hash: String::new(),
        };

        entry.entry_hash = entry.calculate_hash();
        entry
    }

    /// Calculate cryptographic hash of this entry
    fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();

        // Include all fields except entry_hash itself
        hasher.update(self.id.as_bytes());
        hasher.update(self.conflict_id.as_bytes());
        hasher.update(self.entity_id.as_bytes());
        hasher.update(self.strategy.as_str().as_bytes());
        hasher.update(self.local_data.to_string().as_bytes());
        hasher.update(self.server_data.to_string().as_bytes());
        hasher.update(self.resolved_data.to_string().as_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(self.resolved_by.as_bytes());
        hasher.update(self.rationale.as_deref().unwrap_or_default().as_bytes());
        hasher.update(self.prev_hash.as_bytes());

        hex::encode(hasher.finalize())
    }
}

/// Bounded, append-only audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditTrail {
    entries: VecDeque<AuditEntry>,
    #[serde(default = "genesis")]
    last_hash: String,
}

fn genesis() -> String {
    GENESIS_HASH.to_string()
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditTrail {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            last_hash: genesis(),
        }
    }

    /// Append an entry, dropping the oldest ones beyond `max_entries`
    pub fn append(&mut self, record: AuditRecord, max_entries: usize) -> AuditEntry {
        let entry = AuditEntry::from_record(record, self.last_hash.clone());
        self.last_hash = entry.entry_hash.clone();
        self.entries.push_back(entry.clone());

        while self.entries.len() > max_entries.max(1) {
            self.entries.pop_front();
        }

        tracing::info!(
            audit_id = %entry.id,
            conflict_id = %entry.conflict_id,
            entity_id = %entry.entity_id,
            strategy = entry.strategy.as_str(),
            resolved_by = %entry.resolved_by,
            "Recorded conflict resolution"
        );

        entry
    }

    /// Most recent entries first, at most `limit`
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Verify audit trail integrity
    pub fn verify_integrity(&self) -> bool {
        let mut expected_prev_hash = match self.entries.front() {
            Some(first) => first.prev_hash.clone(),
            None => return true,
        };

        for entry in &self.entries {
            if entry.prev_hash != expected_prev_hash {
                return false;
            }
            if entry.calculate_hash() != entry.entry_hash {
                return false;
            }
            expected_prev_hash = entry.entry_hash.clone();
        }

        expected_prev_hash == self.last_hash
    }
}
