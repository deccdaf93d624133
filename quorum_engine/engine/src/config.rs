//! Engine configuration. Every field has a default so a partial JSON file is enough.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QuorumError, Result};
use crate::store::StoreMode;

/// Bounded exponential backoff for ledger submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// A ledger call still running after this long counts as a failed attempt.
    pub submit_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            submit_timeout_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): initial * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a transaction may stay pending before `expire_stale` retires it.
    pub pending_ttl_secs: u64,
    pub retry: RetryPolicy,
    pub audit_capacity: usize,
    pub store_mode: StoreMode,
    /// Attempts for an optimistic read-modify-write before giving up.
    pub cas_retries: u32,
    pub log_dir: String,
    pub log_json: bool,
    /// Default `EnvFilter` directive when RUST_LOG is unset.
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: 86_400,
            retry: RetryPolicy::default(),
            audit_capacity: 500,
            store_mode: StoreMode::Sealed,
            cas_retries: 8,
            log_dir: "logs".to_string(),
            log_json: false,
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| QuorumError::Validation(format!("cannot read config {}: {e}", path.display())))?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pending_ttl_secs == 0 {
            return Err(QuorumError::Validation("pending_ttl_secs must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(QuorumError::Validation("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.submit_timeout_ms == 0 {
            return Err(QuorumError::Validation("retry.submit_timeout_ms must be positive".into()));
        }
        if self.cas_retries == 0 {
            return Err(QuorumError::Validation("cas_retries must be at least 1".into()));
        }
        Ok(())
    }

    pub fn pending_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.pending_ttl_secs).unwrap_or(i64::MAX))
    }
}
