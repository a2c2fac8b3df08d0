//! Engine configuration
//!
//! Defaults can be overridden from `MEDSYNC_*` environment variables via
//! [`SyncConfig::from_env`], and at runtime through
//! [`SyncConfig::apply`] with a partial [`SyncConfigUpdate`].

use crate::conflict_resolution::ResolutionStrategy;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "MEDSYNC";

/// Field names whose divergence always requires human review
pub const DEFAULT_SAFETY_CRITICAL_FIELDS: &[&str] = &[
    "dosage",
    "dose",
    "frequency",
    "warnings",
    "contraindications",
    "interactions",
];

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum entities per upload call
    pub batch_size: usize,
    /// Whether conflict resolutions are written to the audit trail
    pub auditing_enabled: bool,
    /// Strategy used when no safety override applies
    pub default_strategy: ResolutionStrategy,
    /// Global medication safety policy
    pub safety_priority_enabled: bool,
    /// Timestamps closer than this cannot be ordered by last-write-wins
    pub ambiguity_window_ms: u64,
    /// Resolutions scoring below this always require review
    pub confidence_threshold: f64,
    /// Field names treated as safety-critical (matched case-insensitively)
    pub safety_critical_fields: BTreeSet<String>,
    /// Audit entries retained before the oldest are dropped
    pub max_audit_entries: usize,
    /// Backoff doublings before the retry delay stops growing
    pub max_retries: u32,
    /// Base retry backoff (milliseconds)
    pub retry_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            auditing_enabled: true,
            default_strategy: ResolutionStrategy::ThreeWayMerge,
            safety_priority_enabled: true,
            ambiguity_window_ms: 5_000,
            confidence_threshold: 0.5,
            safety_critical_fields: DEFAULT_SAFETY_CRITICAL_FIELDS
                .iter()
                .map(|field| (*field).to_string())
                .collect(),
            max_audit_entries: 1_000,
            max_retries: 5,
            retry_backoff_ms: 1_000,
        }
    }
}

/// Partial configuration update; `None` leaves a value untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfigUpdate {
    pub batch_size: Option<usize>,
    pub auditing_enabled: Option<bool>,
    /// Strategy name, e.g. "three_way_merge"
    pub default_strategy: Option<String>,
    pub safety_priority_enabled: Option<bool>,
    pub ambiguity_window_ms: Option<u64>,
    pub confidence_threshold: Option<f64>,
    pub safety_critical_fields: Option<Vec<String>>,
    pub max_audit_entries: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}

impl SyncConfig {
    /// Load defaults overlaid with `MEDSYNC_*` environment variables.
    ///
    /// `MEDSYNC_SAFETY_CRITICAL_FIELDS` takes a comma separated list.
    pub fn from_env() -> SyncResult<Self> {
        let source = config::Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("safety_critical_fields");

        let update: SyncConfigUpdate = config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()?;

        let mut config = Self::default();
        config.apply(update)?;
        Ok(config)
    }

    /// Merge a partial update into this configuration.
    ///
    /// Invalid values are rejected without modifying `self`. An unknown
    /// strategy name is not an error: it falls back to the safest strategy
    /// available under the resulting safety setting.
    pub fn apply(&mut self, update: SyncConfigUpdate) -> SyncResult<()> {
        let mut next = self.clone();

        if let Some(batch_size) = update.batch_size {
            if batch_size == 0 {
                return Err(SyncError::Configuration(
                    "batch_size must be at least 1".to_string(),
                ));
            }
            next.batch_size = batch_size;
        }
        if let Some(threshold) = update.confidence_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(SyncError::Configuration(format!(
                    "confidence_threshold must be within [0, 1], got {threshold}"
                )));
            }
            next.confidence_threshold = threshold;
        }
        if let Some(enabled) = update.auditing_enabled {
            next.auditing_enabled = enabled;
        }
        if let Some(enabled) = update.safety_priority_enabled {
            next.safety_priority_enabled = enabled;
        }
        if let Some(window) = update.ambiguity_window_ms {
            next.ambiguity_window_ms = window;
        }
        if let Some(fields) = update.safety_critical_fields {
            next.safety_critical_fields = fields
                .into_iter()
                .map(|field| field.trim().to_lowercase())
                .filter(|field| !field.is_empty())
                .collect();
        }
        if let Some(max) = update.max_audit_entries {
            next.max_audit_entries = max;
        }
        if let Some(max) = update.max_retries {
            next.max_retries = max;
        }
        if let Some(backoff) = update.retry_backoff_ms {
            next.retry_backoff_ms = backoff;
        }
        if let Some(name) = update.default_strategy {
            next.default_strategy =
                ResolutionStrategy::parse_or_fallback(&name, next.safety_priority_enabled);
        }

        *self = next;
        Ok(())
    }

    /// Ambiguity window as a chrono duration
    pub fn ambiguity_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.ambiguity_window_ms).unwrap_or(i64::MAX))
    }
}
