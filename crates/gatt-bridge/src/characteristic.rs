//! Characteristic identity map
//!
//! The bridge only ever talks about a closed set of logical
//! [`Characteristic`]s. Each variant is pinned to one native UUID by
//! [`Characteristic::uuid`]; [`CharacteristicMap`] indexes those UUIDs so the
//! opaque identifiers reported by the native stack can be resolved back to
//! variants.
//!
//! # Normalization
//!
//! Native stacks disagree on how UUIDs are spelled. CoreBluetooth reports
//! SIG-assigned characteristics in their 16-bit short form (`2A19`), BlueZ
//! reports the full lower-case 128-bit form. Both normalize to the
//! upper-case hyphenated 128-bit form on the Bluetooth base UUID:
//!
//! ```text
//! 2A19                                  -> 00002A19-0000-1000-8000-00805F9B34FB
//! 00002a19-0000-1000-8000-00805f9b34fb  -> 00002A19-0000-1000-8000-00805F9B34FB
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BridgeError, Result};

/// Low 96 bits of the Bluetooth base UUID `0000xxxx-0000-1000-8000-00805F9B34FB`
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Logical characteristics the bridge knows how to address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Characteristic {
    /// GAP device name
    DeviceName,
    /// GAP appearance
    Appearance,
    /// Battery level in percent
    BatteryLevel,
    /// Device information: manufacturer name string
    ManufacturerName,
    /// Device information: model number string
    ModelNumber,
    /// Device information: serial number string
    SerialNumber,
    /// Device information: hardware revision string
    HardwareRevision,
    /// Device information: firmware revision string
    FirmwareRevision,
    /// Device information: software revision string
    SoftwareRevision,
    /// Nordic UART service, central → peripheral
    UartRx,
    /// Nordic UART service, peripheral → central
    UartTx,
}

impl Characteristic {
    /// All variants, in table order
    pub const ALL: [Characteristic; 11] = [
        Characteristic::DeviceName,
        Characteristic::Appearance,
        Characteristic::BatteryLevel,
        Characteristic::ManufacturerName,
        Characteristic::ModelNumber,
        Characteristic::SerialNumber,
        Characteristic::HardwareRevision,
        Characteristic::FirmwareRevision,
        Characteristic::SoftwareRevision,
        Characteristic::UartRx,
        Characteristic::UartTx,
    ];

    /// Native UUID of this characteristic (upper-case, hyphenated)
    pub fn uuid(&self) -> &'static str {
        match self {
            Characteristic::DeviceName => "00002A00-0000-1000-8000-00805F9B34FB",
            Characteristic::Appearance => "00002A01-0000-1000-8000-00805F9B34FB",
            Characteristic::BatteryLevel => "00002A19-0000-1000-8000-00805F9B34FB",
            Characteristic::ManufacturerName => "00002A29-0000-1000-8000-00805F9B34FB",
            Characteristic::ModelNumber => "00002A24-0000-1000-8000-00805F9B34FB",
            Characteristic::SerialNumber => "00002A25-0000-1000-8000-00805F9B34FB",
            Characteristic::HardwareRevision => "00002A27-0000-1000-8000-00805F9B34FB",
            Characteristic::FirmwareRevision => "00002A26-0000-1000-8000-00805F9B34FB",
            Characteristic::SoftwareRevision => "00002A28-0000-1000-8000-00805F9B34FB",
            Characteristic::UartRx => "6E400002-B5A3-F393-E0A9-E50E24DCCA9E",
            Characteristic::UartTx => "6E400003-B5A3-F393-E0A9-E50E24DCCA9E",
        }
    }

    /// Kebab-case name used in configuration and on the command line
    pub fn name(&self) -> &'static str {
        match self {
            Characteristic::DeviceName => "device-name",
            Characteristic::Appearance => "appearance",
            Characteristic::BatteryLevel => "battery-level",
            Characteristic::ManufacturerName => "manufacturer-name",
            Characteristic::ModelNumber => "model-number",
            Characteristic::SerialNumber => "serial-number",
            Characteristic::HardwareRevision => "hardware-revision",
            Characteristic::FirmwareRevision => "firmware-revision",
            Characteristic::SoftwareRevision => "software-revision",
            Characteristic::UartRx => "uart-rx",
            Characteristic::UartTx => "uart-tx",
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Characteristic {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Characteristic::ALL
            .into_iter()
            .find(|c| c.name() == wanted)
            .ok_or_else(|| BridgeError::UnknownCharacteristic(s.to_string()))
    }
}

/// Normalize a native UUID string to upper-case hyphenated 128-bit form
///
/// Accepts 16-bit (`2A19`) and 32-bit (`00002A19`) SIG short forms as well
/// as any spelling `uuid` can parse.
pub fn normalize_uuid(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let full = match trimmed.len() {
        4 | 8 => {
            let short = u32::from_str_radix(trimmed, 16)
                .map_err(|_| BridgeError::InvalidUuid(raw.to_string()))?;
            Uuid::from_u128(((short as u128) << 96) | BLUETOOTH_BASE_UUID)
        }
        _ => Uuid::parse_str(trimmed).map_err(|_| BridgeError::InvalidUuid(raw.to_string()))?,
    };
    Ok(full.hyphenated().to_string().to_ascii_uppercase())
}

/// Index from normalized native UUID to [`Characteristic`]
///
/// Built once when the bridge context is created. Lookups never fail hard:
/// an unknown or malformed UUID simply resolves to `None`, and callers skip
/// that GATT characteristic.
#[derive(Debug, Clone)]
pub struct CharacteristicMap {
    by_uuid: HashMap<String, Characteristic>,
}

impl CharacteristicMap {
    /// Build the map from every variant
    pub fn new() -> Self {
        let by_uuid = Characteristic::ALL
            .into_iter()
            .map(|c| (c.uuid().to_string(), c))
            .collect();
        Self { by_uuid }
    }

    /// Resolve a native UUID to a logical characteristic
    pub fn resolve(&self, uuid: &str) -> Option<Characteristic> {
        let key = normalize_uuid(uuid).ok()?;
        self.by_uuid.get(&key).copied()
    }

    /// Native UUID of a logical characteristic
    pub fn uuid_of(&self, characteristic: Characteristic) -> &'static str {
        characteristic.uuid()
    }

    /// Number of indexed characteristics
    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }
}

impl Default for CharacteristicMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_round_trip_every_variant() {
        let map = CharacteristicMap::new();
        for c in Characteristic::ALL {
            assert_eq!(map.resolve(map.uuid_of(c)), Some(c), "{c}");
        }
    }

    #[test]
    fn test_uuids_are_distinct_and_normalized() {
        let uuids: HashSet<_> = Characteristic::ALL.iter().map(|c| c.uuid()).collect();
        assert_eq!(uuids.len(), Characteristic::ALL.len());
        assert_eq!(CharacteristicMap::new().len(), Characteristic::ALL.len());
        for c in Characteristic::ALL {
            assert_eq!(normalize_uuid(c.uuid()).unwrap(), c.uuid(), "{c}");
        }
    }

    #[test]
    fn test_unknown_uuid_is_not_found() {
        let map = CharacteristicMap::new();
        assert_eq!(map.resolve("0000FFF1-0000-1000-8000-00805F9B34FB"), None);
        assert_eq!(map.resolve("not-a-uuid"), None);
        assert_eq!(map.resolve(""), None);
    }

    #[test]
    fn test_resolve_accepts_native_spellings() {
        let map = CharacteristicMap::new();
        assert_eq!(map.resolve("2A19"), Some(Characteristic::BatteryLevel));
        assert_eq!(map.resolve("2a19"), Some(Characteristic::BatteryLevel));
        assert_eq!(map.resolve("00002A29"), Some(Characteristic::ManufacturerName));
        assert_eq!(
            map.resolve("6e400003-b5a3-f393-e0a9-e50e24dcca9e"),
            Some(Characteristic::UartTx)
        );
    }

    #[test]
    fn test_normalize_uuid() {
        assert_eq!(
            normalize_uuid("2a00").unwrap(),
            "00002A00-0000-1000-8000-00805F9B34FB"
        );
        assert!(normalize_uuid("zzzz").is_err());
    }

    #[test]
    fn test_name_parsing() {
        assert_eq!(
            "battery-level".parse::<Characteristic>().unwrap(),
            Characteristic::BatteryLevel
        );
        assert_eq!(
            "UART_TX".parse::<Characteristic>().unwrap(),
            Characteristic::UartTx
        );
        assert!("heart-rate".parse::<Characteristic>().is_err());
        for c in Characteristic::ALL {
            assert_eq!(c.to_string().parse::<Characteristic>().unwrap(), c);
        }
    }
}
