//! Configuration types for the BLE bridge
//!
//! This module provides configuration structures for discovery policy,
//! operation timing and native connection options. Durations are written
//! as humantime strings (`"200ms"`, `"5s"`) when serialized.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::radio::ConnectionOptions;

/// Settle delay after first radio initialization
pub const DEFAULT_INIT_SETTLE_MS: u64 = 500;

/// Fallback wait for characteristic discovery per service
pub const DEFAULT_CHARACTERISTIC_SETTLE_MS: u64 = 200;

/// Default read/write acknowledgement timeout
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5000;

/// Default scan window
pub const DEFAULT_SCAN_SECS: u64 = 5;

/// Main configuration for the bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Discovery filtering policy
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Delays and timeouts
    #[serde(default)]
    pub timing: TimingConfig,

    /// Options passed to the native connect call
    #[serde(default)]
    pub connection: ConnectionOptions,
}

impl BridgeConfig {
    /// Parse a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Reject settings no operation could succeed with
    pub fn validate(&self) -> Result<()> {
        let timing = &self.timing;
        if timing.read_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "read_timeout must be non-zero".to_string(),
            ));
        }
        if timing.write_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "write_timeout must be non-zero".to_string(),
            ));
        }
        for (name, value) in [
            ("connect_timeout", timing.connect_timeout),
            ("disconnect_timeout", timing.disconnect_timeout),
            ("service_discovery_timeout", timing.service_discovery_timeout),
        ] {
            if value.is_some_and(|d| d.is_zero()) {
                return Err(BridgeError::InvalidConfig(format!(
                    "{name} must be non-zero when set"
                )));
            }
        }
        Ok(())
    }
}

/// Discovery filtering policy applied by the callback adapter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Case-insensitive substring the advertised name must contain.
    /// `None` accepts every device, including nameless ones.
    #[serde(default)]
    pub name_filter: Option<String>,
}

/// Delays and timeouts for session and scan operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait after the first radio initialization before checking power state
    #[serde(with = "humantime_serde", default = "default_init_settle")]
    pub init_settle_delay: Duration,

    /// Longest wait for one service's characteristics when the native layer
    /// does not report completion
    #[serde(with = "humantime_serde", default = "default_characteristic_settle")]
    pub characteristic_settle_delay: Duration,

    /// Connect timeout; `None` waits for the native callback indefinitely
    #[serde(with = "humantime_serde::option", default)]
    pub connect_timeout: Option<Duration>,

    /// Disconnect timeout; `None` waits indefinitely
    #[serde(with = "humantime_serde::option", default)]
    pub disconnect_timeout: Option<Duration>,

    /// Service discovery timeout; `None` waits indefinitely
    #[serde(with = "humantime_serde::option", default)]
    pub service_discovery_timeout: Option<Duration>,

    /// Default read timeout used by `ReadOptions::new`
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub read_timeout: Duration,

    /// Default write acknowledgement timeout used by `WriteOptions::new`
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub write_timeout: Duration,
}

fn default_init_settle() -> Duration {
    Duration::from_millis(DEFAULT_INIT_SETTLE_MS)
}

fn default_characteristic_settle() -> Duration {
    Duration::from_millis(DEFAULT_CHARACTERISTIC_SETTLE_MS)
}

fn default_operation_timeout() -> Duration {
    Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS)
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            init_settle_delay: default_init_settle(),
            characteristic_settle_delay: default_characteristic_settle(),
            connect_timeout: None,
            disconnect_timeout: None,
            service_discovery_timeout: None,
            read_timeout: default_operation_timeout(),
            write_timeout: default_operation_timeout(),
        }
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept devices whose name contains `filter` (case-insensitive)
    pub fn name_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.discovery.name_filter = Some(filter.into());
        self
    }

    /// Set the post-initialization settle delay
    pub fn init_settle_delay(mut self, delay: Duration) -> Self {
        self.config.timing.init_settle_delay = delay;
        self
    }

    /// Set the per-service characteristic settle delay
    pub fn characteristic_settle_delay(mut self, delay: Duration) -> Self {
        self.config.timing.characteristic_settle_delay = delay;
        self
    }

    /// Bound the connect wait
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.timing.connect_timeout = Some(timeout);
        self
    }

    /// Bound the disconnect wait
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.config.timing.disconnect_timeout = Some(timeout);
        self
    }

    /// Bound the service discovery wait
    pub fn service_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.timing.service_discovery_timeout = Some(timeout);
        self
    }

    /// Set default read and write timeouts
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.timing.read_timeout = timeout;
        self.config.timing.write_timeout = timeout;
        self
    }

    /// Set native connection options
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.config.connection = options;
        self
    }

    /// Build the configuration
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{self, Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
