//! Locking policy configuration

use crate::error::ConfigError;
use std::time::Duration;

/// Monitors per arena block
pub const MONITOR_BLOCK_SIZE: usize = 128;

/// How a single biased object is revoked when the biaser is another live thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevocationMode {
    /// Stop only the biasing thread
    #[default]
    Handshake,
    /// Stop every thread
    Safepoint,
}

/// Configuration for the object synchronizer
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Enable biased locking (default: true)
    pub use_biased_locking: bool,
    /// Delay before biasing is switched on (default: zero, enabled at startup)
    pub biased_locking_startup_delay: Duration,
    /// Single-object revocation mechanism (default: handshake)
    pub bias_revocation_mode: RevocationMode,
    /// Per-type revocations before a bulk rebias (default: 20)
    pub bulk_rebias_threshold: u32,
    /// Per-type revocations before a bulk revoke (default: 40)
    pub bulk_revoke_threshold: u32,
    /// Quiet period after which a type's revocation count is reset (default: 25s)
    pub biased_locking_decay_time: Duration,
    /// Arena capacity in blocks of [`MONITOR_BLOCK_SIZE`] (default: 8192)
    pub max_monitor_blocks: usize,
    /// Monitors moved from the global free list per thread refill (default: 32)
    pub om_free_provision: usize,
    /// In-use percentage of circulating monitors that asks for deflation (default: 90)
    pub monitor_used_deflation_threshold: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            use_biased_locking: true,
            biased_locking_startup_delay: Duration::ZERO,
            bias_revocation_mode: RevocationMode::Handshake,
            bulk_rebias_threshold: 20,
            bulk_revoke_threshold: 40,
            biased_locking_decay_time: Duration::from_millis(25_000),
            max_monitor_blocks: 8192,
            om_free_provision: 32,
            monitor_used_deflation_threshold: 90,
        }
    }
}

impl SyncConfig {
    /// Lightweight and heavyweight locking only
    pub fn without_biased_locking() -> Self {
        Self {
            use_biased_locking: false,
            ..Self::default()
        }
    }

    /// Biased locking with custom bulk thresholds and no decay
    pub fn eager_bulk_policy(rebias: u32, revoke: u32) -> Self {
        Self {
            bulk_rebias_threshold: rebias,
            bulk_revoke_threshold: revoke,
            biased_locking_decay_time: Duration::MAX,
            ..Self::default()
        }
    }

    /// Check field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bulk_rebias_threshold == 0 {
            return Err(ConfigError::Zero("bulk_rebias_threshold"));
        }
        if self.bulk_revoke_threshold <= self.bulk_rebias_threshold {
            return Err(ConfigError::BulkThresholds {
                rebias: self.bulk_rebias_threshold,
                revoke: self.bulk_revoke_threshold,
            });
        }
        if self.max_monitor_blocks == 0 {
            return Err(ConfigError::Zero("max_monitor_blocks"));
        }
        if self.om_free_provision == 0 {
            return Err(ConfigError::Zero("om_free_provision"));
        }
        if self.monitor_used_deflation_threshold > 100 {
            return Err(ConfigError::Percentage {
                name: "monitor_used_deflation_threshold",
                value: self.monitor_used_deflation_threshold,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
        assert!(SyncConfig::without_biased_locking().validate().is_ok());
        assert!(!SyncConfig::without_biased_locking().use_biased_locking);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let config = SyncConfig::eager_bulk_policy(5, 5);
        assert_eq!(
            config.validate(),
            Err(ConfigError::BulkThresholds { rebias: 5, revoke: 5 })
        );
        assert!(SyncConfig::eager_bulk_policy(2, 4).validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_percentage() {
        let config = SyncConfig {
            monitor_used_deflation_threshold: 120,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Percentage { .. })));
    }
}
