//! Peripheral manager configuration

use std::time::Duration;

use crate::protocol::MIN_MAX_UPDATE_LEN;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the peripheral manager
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    /// Maximum notifications waiting per central before targets report `WouldBlockExceeded`
    pub max_queue_depth: usize,
    /// Max update value length assumed when the stack does not report one
    pub default_max_update_len: usize,
    /// Maximum time to wait for the stack to confirm a published service
    pub publish_timeout: Duration,
    /// Maximum time to wait for the stack to confirm advertising
    pub advertising_timeout: Duration,
    /// Whether an explicit advertising stop cancels queued notifications
    pub purge_on_advertising_stop: bool,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 64,
            default_max_update_len: MIN_MAX_UPDATE_LEN,
            publish_timeout: Duration::from_secs(10),
            advertising_timeout: Duration::from_secs(10),
            purge_on_advertising_stop: true,
        }
    }
}

impl PeripheralConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-central queue bound
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set the fallback max update value length (never below the GATT minimum)
    pub fn with_default_max_update_len(mut self, len: usize) -> Self {
        self.default_max_update_len = len.max(MIN_MAX_UPDATE_LEN);
        self
    }

    /// Set publish confirmation timeout
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Set advertising confirmation timeout
    pub fn with_advertising_timeout(mut self, timeout: Duration) -> Self {
        self.advertising_timeout = timeout;
        self
    }

    /// Enable or disable cancelling queued notifications on advertising stop
    pub fn with_purge_on_advertising_stop(mut self, enabled: bool) -> Self {
        self.purge_on_advertising_stop = enabled;
        self
    }

    /// Fallback max update length, clamped to the GATT minimum
    pub(crate) fn fallback_max_update_len(&self) -> usize {
        self.default_max_update_len.max(MIN_MAX_UPDATE_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_clamps_update_len() {
        let config = PeripheralConfig::new().with_default_max_update_len(5);
        assert_eq!(config.default_max_update_len, MIN_MAX_UPDATE_LEN);

        let config = PeripheralConfig::new().with_default_max_update_len(185);
        assert_eq!(config.fallback_max_update_len(), 185);
    }

    #[test]
    fn test_fallback_clamps_deserialized_values() {
        let config = PeripheralConfig {
            default_max_update_len: 0,
            ..PeripheralConfig::default()
        };
        assert_eq!(config.fallback_max_update_len(), MIN_MAX_UPDATE_LEN);
    }
}
