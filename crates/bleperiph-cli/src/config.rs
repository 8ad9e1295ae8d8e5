//! bleperiph CLI Configuration
//!
//! Configuration is read from a TOML file. Every section is optional and
//! falls back to its defaults:
//!
//! - `local_name` and `power_on_timeout_secs` at the top level
//! - `[peripheral]` for the manager itself
//! - `[bluez]` for the BlueZ backend

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use bleperiph::PeripheralConfig;
#[cfg(all(feature = "bluez", target_os = "linux"))]
use bleperiph::BluezConfig;

use crate::error::{CliError, Result};

/// Longest local name that fits a legacy scan response
pub const MAX_LOCAL_NAME_LEN: usize = 29;

// ----------------------------------------------------------------------------
// CLI Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the bleperiph CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Name placed in the advertisement
    pub local_name: String,

    /// How long to wait for the adapter to power on
    pub power_on_timeout_secs: u64,

    /// Peripheral manager settings
    pub peripheral: PeripheralConfig,

    /// BlueZ backend settings
    #[cfg(all(feature = "bluez", target_os = "linux"))]
    pub bluez: BluezConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            local_name: "bleperiph".to_string(),
            power_on_timeout_secs: 10,
            peripheral: PeripheralConfig::default(),
            #[cfg(all(feature = "bluez", target_os = "linux"))]
            bluez: BluezConfig::default(),
        }
    }
}

impl CliConfig {
    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CliError::Config(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml(&contents)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: CliConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn power_on_timeout(&self) -> Duration {
        Duration::from_secs(self.power_on_timeout_secs)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.local_name.is_empty() {
            return Err(CliError::Config("Local name must not be empty".to_string()));
        }
        if self.local_name.len() > MAX_LOCAL_NAME_LEN {
            return Err(CliError::Config(format!(
                "Local name '{}' is longer than {} bytes",
                self.local_name, MAX_LOCAL_NAME_LEN
            )));
        }
        if self.peripheral.max_queue_depth == 0 {
            return Err(CliError::Config(
                "Queue depth must be greater than 0".to_string(),
            ));
        }
        if self.peripheral.publish_timeout.is_zero() || self.peripheral.advertising_timeout.is_zero()
        {
            return Err(CliError::Config(
                "Stack timeouts must be greater than 0".to_string(),
            ));
        }
        if self.power_on_timeout_secs == 0 {
            return Err(CliError::Config(
                "Power-on timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example configuration file
    pub fn example_config() -> String {
        r#"# bleperiph configuration

# Name placed in the advertisement
local_name = "bleperiph"

# Seconds to wait for the adapter to power on
power_on_timeout_secs = 10

[peripheral]
# Notifications waiting per central before targets are refused
max_queue_depth = 64
# Max update length assumed when the stack does not report one
default_max_update_len = 20
# Cancel queued notifications when advertising is stopped
purge_on_advertising_stop = true

[peripheral.publish_timeout]
secs = 10
nanos = 0

[peripheral.advertising_timeout]
secs = 10
nanos = 0

# BlueZ backend (requires the `bluez` feature on Linux)
[bluez]
# adapter_name = "hci0"
notify_queue_len = 4
notify_max_update_len = 20
power_on = true
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CliConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.power_on_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_example_config_parses() {
        let config = CliConfig::from_toml(&CliConfig::example_config()).unwrap();
        assert_eq!(config.local_name, "bleperiph");
        assert_eq!(config.peripheral, PeripheralConfig::default());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = CliConfig::from_toml("local_name = \"sensor\"\n").unwrap();
        assert_eq!(config.local_name, "sensor");
        assert_eq!(config.peripheral.max_queue_depth, 64);
    }

    #[test]
    fn test_config_validation() {
        let mut config = CliConfig::default();
        config.local_name = "a-local-name-longer-than-the-scan-response".to_string();
        assert!(matches!(config.validate(), Err(CliError::Config(_))));

        let mut config = CliConfig::default();
        config.peripheral.max_queue_depth = 0;
        assert!(config.validate().is_err());

        let mut config = CliConfig::default();
        config.peripheral.publish_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = CliConfig::default();
        config.local_name = "uart".to_string();
        let text = config.to_toml().unwrap();
        assert_eq!(CliConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join("bleperiph-cli-missing-config.toml");
        assert!(matches!(
            CliConfig::load_from_file(path),
            Err(CliError::Config(_))
        ));
    }
}
