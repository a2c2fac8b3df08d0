//! Trackable sync entities
//!
//! A [`SyncEntity`] is one unit of replicated data, e.g. a medication record
//! or an adherence entry. Payloads are untyped JSON so field-level diffing
//! works without per-type schemas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One trackable unit of health data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEntity {
    /// Stable entity identifier
    pub id: String,

    /// Entity type (e.g., "medication", "schedule", "adherence")
    #[serde(rename = "type")]
    pub entity_type: String,

    /// Structured payload
    pub data: serde_json::Value,

    /// When this version was produced
    pub timestamp: DateTime<Utc>,

    /// Hex SHA-256 of the canonical payload
    pub checksum: String,

    /// Per-id version counter
    pub version: u64,
}

impl SyncEntity {
    /// Create an entity stamped with the current time
    pub fn new(
        id: impl Into<String>,
        entity_type: impl Into<String>,
        data: serde_json::Value,
        version: u64,
    ) -> Self {
        Self::with_timestamp(id, entity_type, data, version, Utc::now())
    }

    /// Create an entity with an explicit timestamp
    pub fn with_timestamp(
        id: impl Into<String>,
        entity_type: impl Into<String>,
        data: serde_json::Value,
        version: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let checksum = compute_checksum(&data);
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            data,
            timestamp,
            checksum,
            version,
        }
    }

    /// Checksum derived from the payload, ignoring whatever the sender put
    /// in the `checksum` field.
    pub fn computed_checksum(&self) -> String {
        compute_checksum(&self.data)
    }

    /// Estimated wire size in bytes
    pub fn estimated_size(&self) -> u64 {
        serde_json::to_vec(self).map_or(0, |bytes| bytes.len() as u64)
    }

    /// Whether the payload represents a deletion
    pub fn is_tombstone(&self) -> bool {
        self.data.is_null()
    }
}

/// Deterministic fingerprint of a payload.
///
/// `serde_json` keeps object keys sorted (no `preserve_order`), so equal
/// values always serialize to identical bytes regardless of insertion order.
pub fn compute_checksum(data: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_ignores_key_order() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"dosage": "10mg", "name": "Metformin"}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"name": "Metformin", "dosage": "10mg"}"#).unwrap();

        assert_eq!(compute_checksum(&a), compute_checksum(&b));
    }

    #[test]
    fn test_checksum_changes_with_data() {
        let a = json!({"dosage": "10mg"});
        let b = json!({"dosage": "20mg"});

        assert_ne!(compute_checksum(&a), compute_checksum(&b));
        assert_eq!(compute_checksum(&a).len(), 64);
    }

    #[test]
    fn test_entity_serializes_type_field() {
        let entity = SyncEntity::new("med-1", "medication", json!({"name": "Aspirin"}), 1);
        let value = serde_json::to_value(&entity).unwrap();

        assert_eq!(value["type"], "medication");
        assert_eq!(value["checksum"], entity.computed_checksum());
        assert!(entity.estimated_size() > 0);
    }
}
