//! Awaitable request/response sessions over callback-driven BLE radio stacks
//!
//! Native BLE stacks report everything through unsolicited callbacks: the
//! radio powered on, a peripheral connected, services are ready, a value
//! arrived, a write was acknowledged. This crate turns those callbacks back
//! into single-shot awaitable operations on a per-device session.
//!
//! # Architecture
//!
//! The bridge is built from five pieces, leaves first:
//!
//! 1. **Characteristic identity map** - closed set of named characteristics
//!    and their UUIDs ([`characteristic`])
//! 2. **Completion slots** - one replaceable single-shot slot per operation
//!    kind, resolved from the callback context ([`slot`])
//! 3. **Device session** - connect, discover, read, write and disconnect as
//!    awaitable calls ([`session`])
//! 4. **Scanner** - time-boxed discovery producing device sessions ([`scan`])
//! 5. **Callback adapter** - the one object the native stack calls into
//!    ([`adapter`])
//!
//! A [`BridgeContext`] owns the native radio, the adapter and the identity
//! map; scanners and sessions share it.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use gatt_bridge::{
//!     BridgeConfig, BridgeContext, Characteristic, ReadOptions, ScanOptions, Scanner,
//!     ScanStatus, SimulatedRadio,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let context = BridgeContext::new(BridgeConfig::default(), SimulatedRadio::new)?;
//!
//!     let scan = Scanner::new(context).scan(ScanOptions::seconds(5)).await;
//!     if scan.status != ScanStatus::Success {
//!         return Ok(());
//!     }
//!
//!     let mut session = scan.devices.into_iter().next().unwrap();
//!     session.connect().await;
//!     session.discover_services().await;
//!
//!     let battery = session
//!         .read_characteristic(ReadOptions::new(Characteristic::BatteryLevel))
//!         .await;
//!     println!("{:?} {:?}", battery.status, battery.data);
//!
//!     session.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `ble` - [`BtleplugRadio`](radio::BtleplugRadio), a native radio backed by
//!   `btleplug` (requires `libdbus-1-dev` on Linux)
//!
//! # Failure model
//!
//! Public operations never return `Err` and never panic. Each returns an
//! outcome tag: `Exception` for faults in the bridging layer, `Failure` for
//! errors reported by the native stack, `Timeout` when no callback arrived
//! in time. There are no retries.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Leaf types
pub mod characteristic;
pub mod config;
pub mod error;
pub mod models;
pub mod radio;

// Callback plumbing
pub mod adapter;
pub mod slot;

// Call surface
pub mod context;
pub mod scan;
pub mod session;

// Simulated stack for tests and demos
pub mod test_utils;

pub use adapter::{CallbackAdapter, DiscoveredDevice};
pub use characteristic::{normalize_uuid, Characteristic, CharacteristicMap};
pub use config::{
    BridgeConfig, BridgeConfigBuilder, DiscoveryConfig, TimingConfig,
    DEFAULT_CHARACTERISTIC_SETTLE_MS, DEFAULT_INIT_SETTLE_MS, DEFAULT_OPERATION_TIMEOUT_MS,
    DEFAULT_SCAN_SECS,
};
pub use context::BridgeContext;
pub use error::{BridgeError, Result};
pub use models::{
    ConnectResult, DisconnectResult, ReadOptions, ReadResult, ReadStatus, ScanOptions,
    ScanStatus, ServiceDiscoveryResult, WriteOptions, WriteResult,
};
pub use radio::{
    Advertisement, DeviceIdentity, NativeRadio, PeripheralHandle, PowerState, WriteMode,
};
pub use scan::{ScanResult, Scanner};
pub use session::{DeviceSession, SessionState};
pub use slot::{CompletionSlot, OperationKind, SlotHandle};
pub use test_utils::{SimulatedPeripheral, SimulatedRadio, TestFixture};

#[cfg(feature = "ble")]
pub use radio::BtleplugRadio;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
