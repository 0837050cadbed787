//! Engine configuration.
//!
//! # Responsibility
//! - Hold every tunable of the scheduler, the sync processor and storage retry.
//! - Load from a JSON file where each missing field falls back to its default.
//!
//! # Invariants
//! - A config returned by `load`/`from_json_str` has passed `validate()`.

use crate::repo::StorageRetryPolicy;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// Largest delay a single platform timer can represent (signed 32-bit ms).
pub const PLATFORM_MAX_TIMER_DELAY_MS: u64 = 2_147_483_647;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Longest single timer; longer delays are slept in chunks of this size.
    pub max_timer_delay_ms: u64,
    pub snooze_offset_ms: i64,
    /// How far in the past a calendar reminder may be and still fire.
    pub calendar_grace_ms: i64,
    /// Re-arm delay after a transient presentation failure.
    pub present_retry_delay_ms: u64,
    /// Transient presentation failures tolerated per record before it is
    /// marked failed.
    pub max_present_attempts: u32,
    /// Lease held on a record while the platform presents it. A dispatcher
    /// that dies mid-presentation leaves a claim others may take after this.
    pub present_claim_lease_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_timer_delay_ms: PLATFORM_MAX_TIMER_DELAY_MS,
            snooze_offset_ms: 10 * 60 * 1000,
            calendar_grace_ms: 60 * 1000,
            present_retry_delay_ms: 30 * 1000,
            max_present_attempts: 3,
            present_claim_lease_ms: 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncRetryPolicy {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Failures in one round before a task is permanently failed.
    pub max_retries: u32,
    /// Lease taken on a queue item while it is being submitted.
    pub claim_lease_ms: i64,
    /// Queue items fetched per processing pass.
    pub batch_size: usize,
    /// Background wake interval for the sync worker; `None` disables it.
    pub periodic_interval_ms: Option<u64>,
}

impl Default for SyncRetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1_000,
            max_backoff_ms: 5 * 60 * 1000,
            max_retries: 5,
            claim_lease_ms: 60 * 1000,
            batch_size: 50,
            periodic_interval_ms: Some(15 * 60 * 1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub scheduler: SchedulerConfig,
    pub sync: SyncRetryPolicy,
    pub storage_retry: StorageRetryPolicy,
    /// How long terminal notifications and synced tasks are kept.
    pub retention_ms: i64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            sync: SyncRetryPolicy::default(),
            storage_retry: StorageRetryPolicy::default(),
            retention_ms: 30 * DAY_MS,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read config: {err}"),
            Self::Parse(err) => write!(f, "failed to parse config: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl CoreConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let scheduler = &self.scheduler;
        if scheduler.max_timer_delay_ms == 0
            || scheduler.max_timer_delay_ms > PLATFORM_MAX_TIMER_DELAY_MS
        {
            return Err(ConfigError::Invalid(format!(
                "scheduler.max_timer_delay_ms must be within 1..={PLATFORM_MAX_TIMER_DELAY_MS}"
            )));
        }
        if scheduler.snooze_offset_ms <= 0 {
            return Err(ConfigError::Invalid(
                "scheduler.snooze_offset_ms must be positive".to_string(),
            ));
        }
        if scheduler.present_claim_lease_ms <= 0 {
            return Err(ConfigError::Invalid(
                "scheduler.present_claim_lease_ms must be positive".to_string(),
            ));
        }
        if scheduler.calendar_grace_ms < 0 {
            return Err(ConfigError::Invalid(
                "scheduler.calendar_grace_ms cannot be negative".to_string(),
            ));
        }
        if self.sync.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "sync.max_retries must be at least 1".to_string(),
            ));
        }
        if self.sync.base_backoff_ms > self.sync.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "sync.base_backoff_ms cannot exceed sync.max_backoff_ms".to_string(),
            ));
        }
        if self.sync.claim_lease_ms <= 0 || self.sync.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "sync.claim_lease_ms and sync.batch_size must be positive".to_string(),
            ));
        }
        if self.retention_ms < 0 {
            return Err(ConfigError::Invalid(
                "retention_ms cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, CoreConfig, PLATFORM_MAX_TIMER_DELAY_MS};

    #[test]
    fn empty_object_yields_defaults() {
        let config = CoreConfig::from_json_str("{}").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.scheduler.max_timer_delay_ms, PLATFORM_MAX_TIMER_DELAY_MS);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config =
            CoreConfig::from_json_str(r#"{"sync": {"max_retries": 2}, "retention_ms": 1000}"#)
                .unwrap();
        assert_eq!(config.sync.max_retries, 2);
        assert_eq!(config.sync.base_backoff_ms, 1_000);
        assert_eq!(config.retention_ms, 1_000);
    }

    #[test]
    fn rejects_oversized_timer_chunk() {
        let err = CoreConfig::from_json_str(r#"{"scheduler": {"max_timer_delay_ms": 4294967296}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_non_positive_presentation_lease() {
        let err = CoreConfig::from_json_str(r#"{"scheduler": {"present_claim_lease_ms": 0}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse.json");
        std::fs::write(&path, r#"{"scheduler": {"snooze_offset_ms": 5000}}"#).unwrap();
        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.scheduler.snooze_offset_ms, 5_000);
    }
}
