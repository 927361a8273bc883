//! Error types for BLE bridge operations
//!
//! Public session and scan operations never return these errors directly:
//! they fold every failure into the closed outcome tags of their result
//! types. `BridgeError` is the plumbing type used between the native radio,
//! the completion slots and configuration loading.

use thiserror::Error;

use crate::slot::OperationKind;

/// Main error type for bridge plumbing
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Native Radio Errors =====
    /// The native binding raised a fault while issuing a call
    #[error("Native radio fault: {0}")]
    Native(String),

    /// The radio has not been initialized yet
    #[error("Radio not initialized")]
    NotInitialized,

    /// No usable radio adapter on this host
    #[error("No BLE radio adapter available")]
    NoAdapter,

    /// Native layer does not know this peripheral
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    /// Native layer does not know this characteristic handle
    #[error("Unknown characteristic handle {handle} on {device}")]
    UnknownCharacteristicHandle {
        /// Device identity
        device: String,
        /// Native characteristic handle id
        handle: u64,
    },

    // ===== Completion Slot Errors =====
    /// A slot of this kind is already armed and unresolved
    #[error("Operation already in flight: {0}")]
    SlotBusy(OperationKind),

    // ===== Identity Errors =====
    /// UUID string could not be parsed
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    /// Characteristic name not in the closed set
    #[error("Unknown characteristic name: {0}")]
    UnknownCharacteristic(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    // ===== General Errors =====
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Check if the caller may reasonably retry the failed call
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::Native(_) | BridgeError::NotInitialized | BridgeError::SlotBusy(_)
        )
    }

    /// Check if this error originates in the native radio layer
    pub fn is_native(&self) -> bool {
        matches!(
            self,
            BridgeError::Native(_)
                | BridgeError::NotInitialized
                | BridgeError::NoAdapter
                | BridgeError::UnknownPeripheral(_)
                | BridgeError::UnknownCharacteristicHandle { .. }
        )
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::Native(_) => "NATIVE_FAULT",
            BridgeError::NotInitialized => "NOT_INITIALIZED",
            BridgeError::NoAdapter => "NO_ADAPTER",
            BridgeError::UnknownPeripheral(_) => "UNKNOWN_PERIPHERAL",
            BridgeError::UnknownCharacteristicHandle { .. } => "UNKNOWN_CHARACTERISTIC_HANDLE",
            BridgeError::SlotBusy(_) => "SLOT_BUSY",
            BridgeError::InvalidUuid(_) => "INVALID_UUID",
            BridgeError::UnknownCharacteristic(_) => "UNKNOWN_CHARACTERISTIC",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::ConfigParse(_) => "CONFIG_PARSE",
            BridgeError::Internal(_) => "INTERNAL_ERROR",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bridge plumbing
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(feature = "ble")]
impl From<btleplug::Error> for BridgeError {
    fn from(err: btleplug::Error) -> Self {
        match &err {
            btleplug::Error::DeviceNotFound => BridgeError::UnknownPeripheral(err.to_string()),
            _ => BridgeError::Native(err.to_string()),
        }
    }
}
