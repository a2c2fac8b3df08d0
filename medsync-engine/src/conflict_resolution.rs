//! Conflict Resolution
//!
//! Turns a detected [`ConflictData`] into a scored [`Resolution`], or flags
//! it for human review.
//!
//! Key features:
//! - Last-write-wins with an ambiguity window for near-simultaneous edits
//! - Field-level three-way merge against the last synced ancestor
//! - Medication safety override: any divergence in a safety-critical field
//!   (dosage, frequency, warnings, ...) is never auto-resolved
//! - Confidence scoring with a review threshold

use crate::config::SyncConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Confidence for a clean three-way merge
const CLEAN_MERGE_CONFIDENCE: f64 = 0.9;
/// Upper bound for a partially resolved three-way merge
const PARTIAL_MERGE_CONFIDENCE: f64 = 0.45;
/// Confidence when last-write-wins cannot order the edits
const AMBIGUOUS_LWW_CONFIDENCE: f64 = 0.3;
/// Last-write-wins confidence at the edge of the ambiguity window
const MIN_LWW_CONFIDENCE: f64 = 0.6;
/// Last-write-wins confidence for deltas of an hour or more
const MAX_LWW_CONFIDENCE: f64 = 0.95;
/// Name used for non-object payloads during field diffing
const ROOT_FIELD: &str = "$value";

/// Strategy for resolving conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Newer timestamp wins
    LastWriteWins,
    /// Field-level merge against the common ancestor
    ThreeWayMerge,
    /// Escalate any safety-critical divergence, merge the rest
    MedicationSafetyPriority,
    /// Always defer to a human
    UserChoice,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastWriteWins => "last_write_wins",
            Self::ThreeWayMerge => "three_way_merge",
            Self::MedicationSafetyPriority => "medication_safety_priority",
            Self::UserChoice => "user_choice",
        }
    }

    /// Parse a strategy name, falling back to the safest available strategy
    /// when the name is unknown.
    pub fn parse_or_fallback(name: &str, safety_priority_enabled: bool) -> Self {
        name.parse().unwrap_or_else(|_| {
            let fallback = if safety_priority_enabled {
                Self::MedicationSafetyPriority
            } else {
                Self::LastWriteWins
            };
            tracing::warn!(
                requested = name,
                fallback = fallback.as_str(),
                "Unknown resolution strategy, using fallback"
            );
            fallback
        })
    }
}

impl FromStr for ResolutionStrategy {
    type Err = crate::error::SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "last_write_wins" => Ok(Self::LastWriteWins),
            "three_way_merge" => Ok(Self::ThreeWayMerge),
            "medication_safety_priority" => Ok(Self::MedicationSafetyPriority),
            "user_choice" => Ok(Self::UserChoice),
            other => Err(crate::error::SyncError::Configuration(format!(
                "Unknown resolution strategy: {other}"
            ))),
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of conflict detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides modified a previously synced entity
    UpdateUpdate,
    /// Local created the entity offline while the server also has it
    CreateUpdate,
    /// One side deleted, the other modified
    UpdateDelete,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateUpdate => "update_update",
            Self::CreateUpdate => "create_update",
            Self::UpdateDelete => "update_delete",
        }
    }
}

/// Local and server versions of one entity that diverged since last sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictData {
    /// Unique conflict ID
    pub id: Uuid,

    pub entity_id: String,

    pub entity_type: String,

    /// Last synced ancestor, when known
    pub base_version: Option<serde_json::Value>,

    pub local_version: serde_json::Value,

    pub server_version: serde_json::Value,

    pub local_timestamp: DateTime<Utc>,

    pub server_timestamp: DateTime<Utc>,

    pub conflict_type: ConflictType,

    /// When the conflict was detected
    pub detected_at: DateTime<Utc>,
}

impl ConflictData {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        base_version: Option<serde_json::Value>,
        local_version: serde_json::Value,
        server_version: serde_json::Value,
        local_timestamp: DateTime<Utc>,
        server_timestamp: DateTime<Utc>,
        conflict_type: ConflictType,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            base_version,
            local_version,
            server_version,
            local_timestamp,
            server_timestamp,
            conflict_type,
            detected_at: Utc::now(),
        }
    }

    /// Field-level differences between the local and server versions
    pub fn diffs(&self) -> Vec<ConflictDiff> {
        compute_diffs(&self.local_version, &self.server_version)
    }
}

/// Represents a difference between local and server versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDiff {
    /// Dotted path of the field that differs
    pub field_path: String,

    /// Local value (`Null` when absent)
    pub local_value: serde_json::Value,

    /// Server value (`Null` when absent)
    pub server_value: serde_json::Value,
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub conflict_id: Uuid,

    /// Strategy that produced this outcome
    pub strategy: ResolutionStrategy,

    /// Proposed data. Tentative when review is required.
    pub resolved_data: serde_json::Value,

    /// Trust in the automatic outcome, within [0, 1]
    pub confidence: f64,

    pub requires_user_review: bool,

    pub reasoning: String,

    /// Fields a reviewer needs to look at
    pub unresolved_fields: Vec<String>,

    /// Suggested time to re-evaluate an ambiguous outcome
    pub next_retry_time: Option<DateTime<Utc>>,
}

/// Conflict resolution manager
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    default_strategy: ResolutionStrategy,
    safety_priority_enabled: bool,
    ambiguity_window: chrono::Duration,
    confidence_threshold: f64,
    safety_critical_fields: BTreeSet<String>,
}

impl ConflictResolver {
    /// Create a resolver from engine configuration
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            default_strategy: config.default_strategy,
            safety_priority_enabled: config.safety_priority_enabled,
            ambiguity_window: config.ambiguity_window(),
            confidence_threshold: config.confidence_threshold,
            safety_critical_fields: config
                .safety_critical_fields
                .iter()
                .map(|field| field.to_lowercase())
                .collect(),
        }
    }

    /// Resolve a conflict with the configured policy.
    ///
    /// The medication safety check runs first whenever the global policy is
    /// enabled, so a dosage divergence is escalated even if the default
    /// strategy would have picked a winner.
    pub fn resolve(&self, conflict: &ConflictData) -> Resolution {
        let use_safety = self.safety_priority_enabled
            || self.default_strategy == ResolutionStrategy::MedicationSafetyPriority;

        let resolution = if use_safety {
            self.medication_safety_priority(conflict)
                .unwrap_or_else(|| self.resolve_with(self.fallthrough_strategy(), conflict))
        } else {
            self.resolve_with(self.default_strategy, conflict)
        };

        let resolution = self.enforce_threshold(resolution);

        tracing::debug!(
            conflict_id = %conflict.id,
            entity_id = %conflict.entity_id,
            strategy = resolution.strategy.as_str(),
            confidence = resolution.confidence,
            requires_user_review = resolution.requires_user_review,
            "Resolved conflict"
        );

        resolution
    }

    /// Resolve each conflict independently, preserving order
    pub fn resolve_all(&self, conflicts: &[ConflictData]) -> Vec<Resolution> {
        conflicts.iter().map(|conflict| self.resolve(conflict)).collect()
    }

    /// Strategy applied once the safety check found nothing critical
    fn fallthrough_strategy(&self) -> ResolutionStrategy {
        match self.default_strategy {
            ResolutionStrategy::MedicationSafetyPriority => ResolutionStrategy::ThreeWayMerge,
            other => other,
        }
    }

    fn resolve_with(&self, strategy: ResolutionStrategy, conflict: &ConflictData) -> Resolution {
        match strategy {
            ResolutionStrategy::LastWriteWins => self.last_write_wins(conflict),
            ResolutionStrategy::ThreeWayMerge | ResolutionStrategy::MedicationSafetyPriority => {
                self.three_way_merge(conflict)
            }
            ResolutionStrategy::UserChoice => Self::user_choice(conflict),
        }
    }

    /// Newer side wins; near-simultaneous edits are escalated
    pub fn last_write_wins(&self, conflict: &ConflictData) -> Resolution {
        let delta = conflict.local_timestamp - conflict.server_timestamp;
        let abs_delta = if delta < chrono::Duration::zero() { -delta } else { delta };

        if abs_delta < self.ambiguity_window {
            return Resolution {
                conflict_id: conflict.id,
                strategy: ResolutionStrategy::LastWriteWins,
                resolved_data: conflict.local_version.clone(),
                confidence: AMBIGUOUS_LWW_CONFIDENCE,
                requires_user_review: true,
                reasoning: format!(
                    "Local and server timestamps are {}ms apart; timestamps too close to disambiguate",
                    abs_delta.num_milliseconds()
                ),
                unresolved_fields: field_names(&conflict.diffs()),
                next_retry_time: Some(Utc::now() + self.ambiguity_window),
            };
        }

        let (resolved_data, reasoning) = if delta > chrono::Duration::zero() {
            (conflict.local_version.clone(), "Local version is newer")
        } else {
            (conflict.server_version.clone(), "Server version is newer")
        };

        Resolution {
            conflict_id: conflict.id,
            strategy: ResolutionStrategy::LastWriteWins,
            resolved_data,
            confidence: self.lww_confidence(abs_delta),
            requires_user_review: false,
            reasoning: format!("{reasoning} by {}s", abs_delta.num_seconds()),
            unresolved_fields: Vec::new(),
            next_retry_time: None,
        }
    }

    /// Linear from the window edge up to one hour, capped afterwards
    #[allow(clippy::cast_precision_loss)]
    fn lww_confidence(&self, abs_delta: chrono::Duration) -> f64 {
        let window_ms = self.ambiguity_window.num_milliseconds() as f64;
        let hour_ms = chrono::Duration::hours(1).num_milliseconds() as f64;
        let delta_ms = abs_delta.num_milliseconds() as f64;

        if delta_ms >= hour_ms || hour_ms <= window_ms {
            return MAX_LWW_CONFIDENCE;
        }

        let progress = ((delta_ms - window_ms) / (hour_ms - window_ms)).clamp(0.0, 1.0);
        MIN_LWW_CONFIDENCE + (MAX_LWW_CONFIDENCE - MIN_LWW_CONFIDENCE) * progress
    }

    /// Field-level merge against the base version.
    ///
    /// Falls back to last-write-wins when there is no base.
    pub fn three_way_merge(&self, conflict: &ConflictData) -> Resolution {
        let Some(base) = conflict.base_version.as_ref() else {
            let mut resolution = self.last_write_wins(conflict);
            resolution.reasoning = format!(
                "No base version available, fell back to last-write-wins: {}",
                resolution.reasoning
            );
            return resolution;
        };

        let outcome = merge_fields(base, &conflict.local_version, &conflict.server_version);

        if outcome.conflicts.is_empty() {
            return Resolution {
                conflict_id: conflict.id,
                strategy: ResolutionStrategy::ThreeWayMerge,
                resolved_data: outcome.merged,
                confidence: CLEAN_MERGE_CONFIDENCE,
                requires_user_review: false,
                reasoning: format!(
                    "Merged {} non-overlapping field change(s)",
                    outcome.merged_fields
                ),
                unresolved_fields: Vec::new(),
                next_retry_time: None,
            };
        }

        #[allow(clippy::cast_precision_loss)]
        let resolved_fraction = outcome.merged_fields as f64
            / (outcome.merged_fields + outcome.conflicts.len()) as f64;

        Resolution {
            conflict_id: conflict.id,
            strategy: ResolutionStrategy::ThreeWayMerge,
            resolved_data: outcome.merged,
            confidence: PARTIAL_MERGE_CONFIDENCE * resolved_fraction,
            requires_user_review: true,
            reasoning: format!(
                "Unresolved conflicts in field(s): {}",
                outcome.conflicts.join(", ")
            ),
            unresolved_fields: outcome.conflicts,
            next_retry_time: None,
        }
    }

    /// Escalate when any safety-critical field differs.
    ///
    /// Returns `None` when nothing critical diverged, leaving the decision to
    /// the merge strategy.
    pub fn medication_safety_priority(&self, conflict: &ConflictData) -> Option<Resolution> {
        let critical: Vec<String> = conflict
            .diffs()
            .into_iter()
            .filter(|diff| self.is_safety_critical(&diff.field_path))
            .map(|diff| diff.field_path)
            .collect();

        if critical.is_empty() {
            return None;
        }

        tracing::warn!(
            conflict_id = %conflict.id,
            entity_id = %conflict.entity_id,
            fields = ?critical,
            "Safety-critical fields diverged, escalating to user review"
        );

        Some(Resolution {
            conflict_id: conflict.id,
            strategy: ResolutionStrategy::MedicationSafetyPriority,
            resolved_data: conflict.server_version.clone(),
            confidence: 0.0,
            requires_user_review: true,
            reasoning: format!(
                "safety-critical field(s) changed: {}",
                critical.join(", ")
            ),
            unresolved_fields: critical,
            next_retry_time: None,
        })
    }

    fn user_choice(conflict: &ConflictData) -> Resolution {
        Resolution {
            conflict_id: conflict.id,
            strategy: ResolutionStrategy::UserChoice,
            resolved_data: conflict.local_version.clone(),
            confidence: 0.0,
            requires_user_review: true,
            reasoning: "Resolution deferred to user choice".to_string(),
            unresolved_fields: field_names(&conflict.diffs()),
            next_retry_time: None,
        }
    }

    /// A field path is critical if any of its segments is a critical name
    pub fn is_safety_critical(&self, field_path: &str) -> bool {
        field_path
            .split('.')
            .any(|segment| self.safety_critical_fields.contains(&segment.to_lowercase()))
    }

    fn enforce_threshold(&self, mut resolution: Resolution) -> Resolution {
        resolution.confidence = resolution.confidence.clamp(0.0, 1.0);
        if resolution.confidence < self.confidence_threshold && !resolution.requires_user_review {
            resolution.requires_user_review = true;
            resolution.reasoning = format!(
                "{} (confidence {:.2} below review threshold {:.2})",
                resolution.reasoning, resolution.confidence, self.confidence_threshold
            );
        }
        resolution
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(&SyncConfig::default())
    }
}

/// Result of a field-level three-way merge
#[derive(Debug, Clone, PartialEq)]
struct MergeOutcome {
    merged: serde_json::Value,
    /// Fields that took a value from exactly one side or agreed on both
    merged_fields: usize,
    /// Fields changed differently on both sides
    conflicts: Vec<String>,
}

fn merge_fields(
    base: &serde_json::Value,
    local: &serde_json::Value,
    server: &serde_json::Value,
) -> MergeOutcome {
    let (Some(base_obj), Some(local_obj), Some(server_obj)) =
        (base.as_object(), local.as_object(), server.as_object())
    else {
        // Non-object payloads merge as a single field
        return merge_scalar(base, local, server);
    };

    let keys: BTreeSet<&String> = base_obj
        .keys()
        .chain(local_obj.keys())
        .chain(server_obj.keys())
        .collect();

    let mut merged = serde_json::Map::new();
    let mut merged_fields = 0;
    let mut conflicts = Vec::new();

    for key in keys {
        let base_val = base_obj.get(key);
        let local_val = local_obj.get(key);
        let server_val = server_obj.get(key);

        let local_changed = local_val != base_val;
        let server_changed = server_val != base_val;

        let chosen = match (local_changed, server_changed) {
            (false, false) => base_val,
            (true, false) => {
                merged_fields += 1;
                local_val
            }
            (false, true) => {
                merged_fields += 1;
                server_val
            }
            (true, true) if local_val == server_val => {
                merged_fields += 1;
                local_val
            }
            (true, true) => {
                conflicts.push(key.clone());
                local_val
            }
        };

        // Absent means the field was removed on the winning side
        if let Some(value) = chosen {
            merged.insert(key.clone(), value.clone());
        }
    }

    MergeOutcome {
        merged: serde_json::Value::Object(merged),
        merged_fields,
        conflicts,
    }
}

fn merge_scalar(
    base: &serde_json::Value,
    local: &serde_json::Value,
    server: &serde_json::Value,
) -> MergeOutcome {
    let local_changed = local != base;
    let server_changed = server != base;

    let (merged, conflicts) = match (local_changed, server_changed) {
        (true, true) if local != server => (local.clone(), vec![ROOT_FIELD.to_string()]),
        (false, true) => (server.clone(), Vec::new()),
        _ => (local.clone(), Vec::new()),
    };

    MergeOutcome {
        merged,
        merged_fields: usize::from(conflicts.is_empty() && (local_changed || server_changed)),
        conflicts,
    }
}

/// Compute field-level diffs between two JSON values.
///
/// Objects and arrays are walked recursively and reported with dotted paths,
/// array elements by index (`items.0.dosage`). A field present on only one
/// side is reported with `Null` on the other. When a container is replaced
/// by a value of another shape, the replaced node is reported and every
/// nested field of the container is reported against `Null` as well.
pub fn compute_diffs(local: &serde_json::Value, server: &serde_json::Value) -> Vec<ConflictDiff> {
    let mut diffs = Vec::new();
    collect_diffs("", local, server, &mut diffs);
    diffs
}

fn collect_diffs(
    prefix: &str,
    local: &serde_json::Value,
    server: &serde_json::Value,
    diffs: &mut Vec<ConflictDiff>,
) {
    use serde_json::Value;

    if local == server {
        return;
    }

    match (local, server) {
        (Value::Object(local_obj), Value::Object(server_obj)) => {
            let keys: BTreeSet<&String> = local_obj.keys().chain(server_obj.keys()).collect();
            for key in keys {
                collect_diffs(
                    &child_path(prefix, key),
                    local_obj.get(key).unwrap_or(&Value::Null),
                    server_obj.get(key).unwrap_or(&Value::Null),
                    diffs,
                );
            }
        }
        (Value::Array(local_items), Value::Array(server_items)) => {
            for index in 0..local_items.len().max(server_items.len()) {
                collect_diffs(
                    &child_path(prefix, &index.to_string()),
                    local_items.get(index).unwrap_or(&Value::Null),
                    server_items.get(index).unwrap_or(&Value::Null),
                    diffs,
                );
            }
        }
        _ => {
            diffs.push(ConflictDiff {
                field_path: if prefix.is_empty() {
                    ROOT_FIELD.to_string()
                } else {
                    prefix.to_string()
                },
                local_value: local.clone(),
                server_value: server.clone(),
            });
            collect_orphaned(prefix, local, true, diffs);
            collect_orphaned(prefix, server, false, diffs);
        }
    }
}

/// Report every field nested under a container whose counterpart on the
/// other side is not a container of the same shape
fn collect_orphaned(
    prefix: &str,
    value: &serde_json::Value,
    is_local: bool,
    diffs: &mut Vec<ConflictDiff>,
) {
    use serde_json::Value;

    let children: Vec<(String, &Value)> = match value {
        Value::Object(map) => map.iter().map(|(key, child)| (key.clone(), child)).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, child)| (index.to_string(), child))
            .collect(),
        _ => return,
    };

    for (key, child) in children {
        let path = child_path(prefix, &key);
        let (local_value, server_value) = if is_local {
            (child.clone(), Value::Null)
        } else {
            (Value::Null, child.clone())
        };
        diffs.push(ConflictDiff {
            field_path: path.clone(),
            local_value,
            server_value,
        });
        collect_orphaned(&path, child, is_local, diffs);
    }
}

fn child_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn field_names(diffs: &[ConflictDiff]) -> Vec<String> {
    diffs.iter().map(|diff| diff.field_path.clone()).collect()
}
