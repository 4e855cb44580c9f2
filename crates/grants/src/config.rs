//! Engine configuration

use std::time::Duration;

use crate::error::{GrantError, GrantResult};

/// Tuning knobs for the grant engine.
///
/// Both values affect liveness and memory only, never correctness: the
/// ledger's durable check is the source of truth regardless of how long
/// cache entries are retained or how long a lock wait is allowed.
#[derive(Debug, Clone)]
pub struct GrantConfig {
    /// Bounded wait for the per-payment lock before giving up with
    /// `LockTimeout`
    pub lock_wait: Duration,
    /// How long finalized payment refs stay in the idempotency cache
    pub cache_retention: Duration,
}

impl Default for GrantConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(5),
            cache_retention: Duration::from_secs(3 * 60 * 60),
        }
    }
}

impl GrantConfig {
    /// Build from environment variables, falling back to defaults.
    ///
    /// - `TOPUP_LOCK_WAIT_MS`
    /// - `TOPUP_CACHE_RETENTION_SECS`
    pub fn from_env() -> GrantResult<Self> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("TOPUP_LOCK_WAIT_MS") {
            let ms: u64 = raw
                .parse()
                .map_err(|_| GrantError::Config(format!("invalid TOPUP_LOCK_WAIT_MS: {raw}")))?;
            config.lock_wait = Duration::from_millis(ms);
        }

        if let Ok(raw) = std::env::var("TOPUP_CACHE_RETENTION_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                GrantError::Config(format!("invalid TOPUP_CACHE_RETENTION_SECS: {raw}"))
            })?;
            config.cache_retention = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GrantConfig::default();
        assert_eq!(config.lock_wait, Duration::from_secs(5));
        assert_eq!(config.cache_retention, Duration::from_secs(10_800));
    }
}
