//! Request options and result tags for the public call surface
//!
//! Every public operation returns one of a closed set of outcome tags. None of
//! them raise: faults in the bridging layer surface as `Exception`, explicit
//! native errors as `Failure`, and an unresolved wait as `Timeout`.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::characteristic::Characteristic;
use crate::config::{TimingConfig, DEFAULT_OPERATION_TIMEOUT_MS, DEFAULT_SCAN_SECS};

/// Result of `DeviceSession::connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectResult {
    /// No outcome recorded
    #[default]
    Null,
    /// Fault in the bridging layer
    Exception,
    /// Native stack refused the connection
    Failure,
    /// Configured connect timeout elapsed
    Timeout,
    /// Link established
    Connected,
}

/// Result of `DeviceSession::discover_services`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceDiscoveryResult {
    /// No outcome recorded
    #[default]
    Null,
    /// Fault in the bridging layer
    Exception,
    /// Native stack reported an error, or the session was not connected
    Failure,
    /// Configured discovery timeout elapsed
    Timeout,
    /// Services and characteristics mapped
    Success,
}

/// Result of `DeviceSession::disconnect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisconnectResult {
    /// No outcome recorded
    #[default]
    Null,
    /// Fault in the bridging layer
    Exception,
    /// Native stack reported an error
    Failure,
    /// Configured disconnect timeout elapsed
    Timeout,
    /// Link torn down
    Disconnected,
}

/// Status tag of a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadStatus {
    /// No outcome recorded
    #[default]
    Null,
    /// Fault in the bridging layer
    Exception,
    /// Native stack reported an error
    Failure,
    /// Characteristic absent from the session's mapping
    CharacteristicNotFound,
    /// No value arrived within the timeout
    Timeout,
    /// Value read
    Success,
}

/// Result of `DeviceSession::read_characteristic`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadResult {
    /// Outcome tag
    pub status: ReadStatus,
    /// Raw value; empty unless `status` is `Success`
    pub data: Bytes,
}

impl ReadResult {
    /// Result with no payload
    pub fn empty(status: ReadStatus) -> Self {
        Self {
            status,
            data: Bytes::new(),
        }
    }

    /// Successful read
    pub fn success(data: Bytes) -> Self {
        Self {
            status: ReadStatus::Success,
            data,
        }
    }

    /// Whether the read succeeded
    pub fn is_success(&self) -> bool {
        self.status == ReadStatus::Success
    }
}

/// Result of `DeviceSession::write_characteristic`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteResult {
    /// No outcome recorded
    #[default]
    Null,
    /// Fault in the bridging layer
    Exception,
    /// Native stack reported an error
    Failure,
    /// Characteristic absent from the session's mapping
    CharacteristicNotFound,
    /// No acknowledgement within the timeout
    Timeout,
    /// Written (and acknowledged, when a response was requested)
    Success,
}

/// Status tag of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanStatus {
    /// No outcome recorded
    #[default]
    Null,
    /// Fault in the bridging layer
    Exception,
    /// Native stack reported an error
    Failure,
    /// Radio missing or not powered on
    RadioDisabled,
    /// Scan window closed with nothing accepted
    NoDevicesFound,
    /// At least one device accepted
    Success,
}

macro_rules! display_as_debug {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        })*
    };
}

display_as_debug!(
    ConnectResult,
    ServiceDiscoveryResult,
    DisconnectResult,
    ReadStatus,
    WriteResult,
    ScanStatus
);

/// Options for a characteristic read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Characteristic to read
    pub characteristic: Characteristic,
    /// How long to wait for the value
    pub timeout: Duration,
}

impl ReadOptions {
    /// Read with the default 5 second timeout
    pub fn new(characteristic: Characteristic) -> Self {
        Self {
            characteristic,
            timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
        }
    }

    /// Read with the configured default timeout
    pub fn from_timing(characteristic: Characteristic, timing: &TimingConfig) -> Self {
        Self::new(characteristic).with_timeout(timing.read_timeout)
    }

    /// Override the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Options for a characteristic write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    /// Characteristic to write
    pub characteristic: Characteristic,
    /// Raw bytes to write
    pub data: Bytes,
    /// Wait for the peripheral's acknowledgement
    pub with_response: bool,
    /// How long to wait for the acknowledgement
    pub timeout: Duration,
}

impl WriteOptions {
    /// Write raw bytes with the default 5 second timeout
    pub fn new(characteristic: Characteristic, with_response: bool, data: impl Into<Bytes>) -> Self {
        Self {
            characteristic,
            data: data.into(),
            with_response,
            timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
        }
    }

    /// Write the UTF-8 bytes of `parts`, concatenated in order
    pub fn from_strings<I, S>(characteristic: Characteristic, with_response: bool, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let data: Vec<u8> = parts
            .into_iter()
            .flat_map(|part| part.as_ref().as_bytes().to_vec())
            .collect();
        Self::new(characteristic, with_response, data)
    }

    /// Use the configured default write timeout
    pub fn with_timing(self, timing: &TimingConfig) -> Self {
        self.with_timeout(timing.write_timeout)
    }

    /// Override the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Options for a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    /// How long to listen for advertisements
    pub duration: Duration,
    /// Native service UUID filter; empty scans for everything
    pub service_uuids: Vec<String>,
}

impl ScanOptions {
    /// Scan for `secs` seconds without a service filter
    pub fn seconds(secs: u64) -> Self {
        Self {
            duration: Duration::from_secs(secs),
            service_uuids: Vec::new(),
        }
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::seconds(DEFAULT_SCAN_SECS)
    }
}
