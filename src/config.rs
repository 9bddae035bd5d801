//! Manager-level configuration.
//!
//! # Example
//!
//! ```
//! use distd_cache::ManagerConfig;
//!
//! // Defaults
//! let config = ManagerConfig::default();
//! assert_eq!(config.sync_check_interval_ms, 60_000); // 1 minute
//!
//! // Tighter sync cadence for tests or small clusters
//! let config = ManagerConfig {
//!     sync_check_interval_ms: 1_000,
//!     ..Default::default()
//! };
//! assert_eq!(config.queue_capacity, 10_240);
//! ```

use std::time::Duration;

use serde::Deserialize;

/// Configuration shared by every cache owned by one
/// [`CacheManager`](crate::CacheManager).
///
/// All fields have sensible defaults. The sync interval is the convergence
/// knob: nodes are guaranteed to agree within about three intervals even
/// after dropped messages. One second is the minimum sensible value; the
/// library does not enforce a floor beyond rejecting zero.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Interval between reconciliation passes, in milliseconds (default: 1 minute).
    #[serde(default = "default_sync_check_interval_ms")]
    pub sync_check_interval_ms: u64,

    /// Capacity of the internal message and notification queues (default: 10 240).
    /// Enqueueing on a full queue drops the item; the reconciler repairs the miss.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_sync_check_interval_ms() -> u64 {
    60_000
}

fn default_queue_capacity() -> usize {
    10_240
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            sync_check_interval_ms: default_sync_check_interval_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl ManagerConfig {
    /// Replace zero values with defaults, mirroring how an omitted field
    /// behaves during deserialization.
    pub(crate) fn normalized(mut self) -> Self {
        if self.sync_check_interval_ms == 0 {
            self.sync_check_interval_ms = default_sync_check_interval_ms();
        }
        if self.queue_capacity == 0 {
            self.queue_capacity = default_queue_capacity();
        }
        self
    }

    pub(crate) fn sync_check_interval(&self) -> Duration {
        Duration::from_millis(self.sync_check_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.sync_check_interval_ms, 60_000);
        assert_eq!(config.queue_capacity, 10_240);
    }

    #[test]
    fn test_deserialize_empty_object_uses_defaults() {
        let config: ManagerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.sync_check_interval_ms, 60_000);
        assert_eq!(config.queue_capacity, 10_240);
    }

    #[test]
    fn test_normalized_replaces_zeroes() {
        let config = ManagerConfig {
            sync_check_interval_ms: 0,
            queue_capacity: 0,
        }
        .normalized();
        assert_eq!(config.sync_check_interval_ms, 60_000);
        assert_eq!(config.queue_capacity, 10_240);
    }

    #[test]
    fn test_interval_conversion() {
        let config = ManagerConfig {
            sync_check_interval_ms: 1_500,
            ..Default::default()
        };
        assert_eq!(config.sync_check_interval(), Duration::from_millis(1_500));
    }
}
