//! Native radio capability consumed by the bridge
//!
//! The bridge never talks to a BLE stack directly. It drives an implementation
//! of [`NativeRadio`], whose methods are fire-and-forget: they only report
//! faults raised while *issuing* the call. Every outcome (connected, services
//! ready, value read, write acknowledged) arrives later through the
//! [`CallbackAdapter`](crate::adapter::CallbackAdapter) the radio was built
//! with.
//!
//! Implementations:
//!
//! - [`BtleplugRadio`] - real adapters via `btleplug` (requires `ble` feature)
//! - [`SimulatedRadio`](crate::test_utils::SimulatedRadio) - scriptable stack for tests and demos
//!
//! # Feature Requirements
//!
//! - `ble`: Requires BlueZ development files on Linux
//!   ```bash
//!   apt install libdbus-1-dev
//!   ```

#[cfg(feature = "ble")]
mod btleplug_radio;
#[cfg(feature = "ble")]
pub use btleplug_radio::BtleplugRadio;

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Opaque, stable identifier of a radio-visible peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Wrap a native peripheral identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Native peripheral object reference
///
/// The native stack may hand back a different instance on connect than the
/// one discovered, so a handle carries an instance number next to the
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle {
    /// Device the handle refers to
    pub identity: DeviceIdentity,
    /// Native object instance
    pub instance: u64,
}

impl PeripheralHandle {
    /// Create a handle
    pub fn new(identity: DeviceIdentity, instance: u64) -> Self {
        Self { identity, instance }
    }
}

/// Native service reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    /// Native handle id
    pub id: u64,
    /// Service UUID as reported by the stack
    pub uuid: String,
}

/// Native characteristic reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    /// Native handle id, unique per peripheral
    pub id: u64,
    /// Characteristic UUID as reported by the stack
    pub uuid: String,
}

/// Radio power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// State not yet reported
    #[default]
    Unknown,
    /// Radio is resetting
    Resetting,
    /// Host has no BLE support
    Unsupported,
    /// App is not allowed to use the radio
    Unauthorized,
    /// Radio is switched off
    PoweredOff,
    /// Radio is on and usable
    PoweredOn,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::Unknown => write!(f, "unknown"),
            PowerState::Resetting => write!(f, "resetting"),
            PowerState::Unsupported => write!(f, "unsupported"),
            PowerState::Unauthorized => write!(f, "unauthorized"),
            PowerState::PoweredOff => write!(f, "powered off"),
            PowerState::PoweredOn => write!(f, "powered on"),
        }
    }
}

/// Options passed to the native connect primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Ask the system to alert on connection while suspended
    #[serde(default = "default_true")]
    pub notify_on_connection: bool,
    /// Ask the system to alert on disconnection while suspended
    #[serde(default = "default_true")]
    pub notify_on_disconnection: bool,
    /// Ask the system to alert on notifications while suspended
    #[serde(default = "default_true")]
    pub notify_on_notification: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            notify_on_connection: true,
            notify_on_disconnection: true,
            notify_on_notification: true,
        }
    }
}

/// GATT write mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Peripheral acknowledges the write
    WithResponse,
    /// Fire and forget
    WithoutResponse,
}

/// Scan filter handed to the native scan primitive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Only report peripherals advertising one of these services; empty = all
    #[serde(default)]
    pub service_uuids: Vec<String>,
}

/// Raw advertisement data delivered with a discovery callback
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertised local name
    pub local_name: Option<String>,
    /// Manufacturer specific data
    pub manufacturer_data: Bytes,
    /// Advertised service UUIDs
    pub service_uuids: Vec<String>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
}

/// Native BLE radio primitives
///
/// All calls return immediately. `Err` means the native binding faulted while
/// issuing the call; the operation's real outcome is delivered later through
/// the callback adapter.
pub trait NativeRadio: Send + Sync {
    /// One-time radio initialization; power state is reported asynchronously
    fn initialize(&self) -> Result<()>;

    /// Current power state as last reported by the stack
    fn power_state(&self) -> PowerState;

    /// Start connecting to a peripheral
    fn connect(&self, peripheral: &PeripheralHandle, options: &ConnectionOptions) -> Result<()>;

    /// Cancel a pending connect or tear down an established link
    fn cancel_connection(&self, peripheral: &PeripheralHandle) -> Result<()>;

    /// Start service discovery
    fn discover_services(&self, peripheral: &PeripheralHandle) -> Result<()>;

    /// Services discovered so far
    fn services(&self, peripheral: &PeripheralHandle) -> Result<Vec<ServiceHandle>>;

    /// Start characteristic discovery for one service
    fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
    ) -> Result<()>;

    /// Characteristics of `service` discovered so far
    fn characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
    ) -> Result<Vec<CharacteristicHandle>>;

    /// Start reading a characteristic value
    fn read_value(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
    ) -> Result<()>;

    /// Start writing a characteristic value
    fn write_value(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()>;

    /// Start scanning for advertisements
    fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    /// Stop scanning
    fn stop_scan(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_state_display() {
        assert_eq!(PowerState::PoweredOn.to_string(), "powered on");
        assert_eq!(PowerState::default(), PowerState::Unknown);
    }

    #[test]
    fn test_connection_options_defaults() {
        let options: ConnectionOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, ConnectionOptions::default());
        assert!(options.notify_on_disconnection);
    }

    #[test]
    fn test_device_identity_display() {
        let id = DeviceIdentity::from("E2C56DB5-DFFB-48D2-B060-D0F5A71096E0");
        assert_eq!(id.to_string(), "E2C56DB5-DFFB-48D2-B060-D0F5A71096E0");
        assert_eq!(id.as_str(), id.to_string());
    }
}
