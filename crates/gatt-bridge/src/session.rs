//! Per-device session state machine
//!
//! A [`DeviceSession`] owns one peripheral's connection lifecycle and its
//! characteristic mapping. Each operation follows the same shape: arm the
//! operation's completion slot, issue the fire-and-forget native call, wait
//! for the callback adapter to resolve the slot, then interpret the outcome.
//!
//! ```text
//!   Idle ──connect──► Connecting ──► Connected ──discover──► ServicesDiscovered
//!                         │              │                          │
//!                         └─failure──────┴───────disconnect─────────┴──► Disconnected
//! ```
//!
//! Operations never fail with an error. Native faults and panics are folded
//! into the `Exception` tag of each operation's result.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tracing::{debug, error, info, trace, warn};

use crate::adapter::{
    ConnectOutcome, DiscoveredDevice, DisconnectOutcome, DiscoveryOutcome, ReadOutcome,
    SessionLink, WriteOutcome,
};
use crate::characteristic::Characteristic;
use crate::context::BridgeContext;
use crate::error::{BridgeError, Result};
use crate::models::{
    ConnectResult, DisconnectResult, ReadOptions, ReadResult, ReadStatus, ServiceDiscoveryResult,
    WriteOptions, WriteResult,
};
use crate::radio::{
    Advertisement, CharacteristicHandle, DeviceIdentity, PeripheralHandle, WriteMode,
};

/// Connection state of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Created from a discovery, never connected
    #[default]
    Idle,
    /// Native connect issued, waiting for the callback
    Connecting,
    /// Link established
    Connected,
    /// Link established and characteristics mapped
    ServicesDiscovered,
    /// Link torn down, on request or not
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::ServicesDiscovered => write!(f, "services-discovered"),
            SessionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Run an operation body, turning panics into [`BridgeError::Internal`]
pub(crate) async fn guarded<T, F>(operation: &'static str, body: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(body).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(BridgeError::Internal(format!("{operation} panicked: {message}")))
        }
    }
}

/// Awaitable operations on one peripheral
///
/// Operations take `&mut self`: one call at a time per session.
pub struct DeviceSession {
    context: Arc<BridgeContext>,
    link: Arc<SessionLink>,
    advertisement: Advertisement,
    characteristics: HashMap<Characteristic, CharacteristicHandle>,
}

impl DeviceSession {
    /// Create a session for a discovered device and register it with the
    /// context's callback adapter
    ///
    /// If another session for the same device is still alive, both share its
    /// link: connection state and native handle, not the characteristic
    /// mapping.
    pub fn new(context: Arc<BridgeContext>, device: DiscoveredDevice) -> Self {
        let link = context.adapter().attach(device.identity);
        trace!(device = %link.identity, state = %*link.state.lock(), "session created");
        Self {
            context,
            link,
            advertisement: device.advertisement,
            characteristics: HashMap::new(),
        }
    }

    // ===== Introspection =====

    /// Native identity of the peripheral
    pub fn identity(&self) -> &DeviceIdentity {
        &self.link.identity
    }

    /// Advertised local name, empty if none
    pub fn name(&self) -> &str {
        self.advertisement.local_name.as_deref().unwrap_or_default()
    }

    /// Manufacturer data from the advertisement
    pub fn advertised_data(&self) -> &Bytes {
        &self.advertisement.manufacturer_data
    }

    /// Signal strength at discovery time
    pub fn rssi(&self) -> Option<i16> {
        self.advertisement.rssi
    }

    /// Native peripheral handle currently in use
    pub fn peripheral(&self) -> PeripheralHandle {
        self.link.peripheral.lock().clone()
    }

    /// Current connection state
    pub fn state(&self) -> SessionState {
        *self.link.state.lock()
    }

    /// Whether the link is up
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connected | SessionState::ServicesDiscovered
        )
    }

    /// Whether a connect is outstanding
    pub fn is_connecting(&self) -> bool {
        self.state() == SessionState::Connecting
    }

    /// Whether service discovery mapped `characteristic` on the current link
    pub fn has_characteristic(&self, characteristic: Characteristic) -> bool {
        self.handle_for(characteristic).is_some()
    }

    /// Characteristics mapped on the current link, in declaration order
    pub fn characteristics(&self) -> Vec<Characteristic> {
        if self.link_lost() {
            return Vec::new();
        }
        let mut mapped: Vec<_> = self.characteristics.keys().copied().collect();
        mapped.sort();
        mapped
    }

    /// Whether a read of `characteristic` is outstanding
    pub fn is_read_in_flight(&self, characteristic: Characteristic) -> bool {
        self.handle_for(characteristic)
            .is_some_and(|handle| self.link.reads_in_flight.lock().contains(&handle.id))
    }

    /// Mapping entry, unless the link it was discovered on is gone
    fn handle_for(&self, characteristic: Characteristic) -> Option<&CharacteristicHandle> {
        if self.link_lost() {
            return None;
        }
        self.characteristics.get(&characteristic)
    }

    fn link_lost(&self) -> bool {
        self.state() == SessionState::Disconnected
    }

    /// Forget handles from a link that dropped underneath us
    fn drop_stale_mapping(&mut self) {
        if self.link_lost() && !self.characteristics.is_empty() {
            debug!(device = %self.link.identity, "link lost, dropping characteristic mapping");
            self.characteristics.clear();
        }
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.link.state.lock();
        if *current != state {
            trace!(device = %self.link.identity, from = %*current, to = %state, "state change");
            *current = state;
        }
    }

    // ===== Operations =====

    /// Connect to the peripheral
    pub async fn connect(&mut self) -> ConnectResult {
        match guarded("connect", self.try_connect()).await {
            Ok(result) => result,
            Err(e) => {
                error!(device = %self.link.identity, error = %e, "connect faulted");
                self.link.slots.connect.disarm();
                self.set_state(SessionState::Disconnected);
                if let Err(e) = self.context.radio().cancel_connection(&self.peripheral()) {
                    debug!(device = %self.link.identity, error = %e, "cancel after fault also failed");
                }
                ConnectResult::Exception
            }
        }
    }

    async fn try_connect(&mut self) -> Result<ConnectResult> {
        self.context.ensure_initialized().await?;

        info!(device = %self.link.identity, name = self.name(), "connecting");
        self.set_state(SessionState::Connecting);

        self.characteristics.clear();
        let current = self.peripheral();
        let pending = self.link.slots.connect.arm();
        self.context
            .radio()
            .connect(&current, &self.context.config().connection)?;

        match pending.wait_for(self.context.config().timing.connect_timeout).await {
            Some(ConnectOutcome::Connected(peripheral)) => {
                if peripheral.instance != current.instance {
                    debug!(
                        device = %self.link.identity,
                        instance = peripheral.instance,
                        "adopting peripheral handle from connect callback"
                    );
                }
                *self.link.peripheral.lock() = peripheral;
                self.set_state(SessionState::Connected);
                info!(device = %self.link.identity, "connected");
                Ok(ConnectResult::Connected)
            }
            Some(ConnectOutcome::Failed(error)) => {
                warn!(device = %self.link.identity, %error, "connect failed");
                self.set_state(SessionState::Disconnected);
                Ok(ConnectResult::Failure)
            }
            None => {
                warn!(device = %self.link.identity, "connect timed out, cancelling");
                self.set_state(SessionState::Disconnected);
                self.context.radio().cancel_connection(&current)?;
                Ok(ConnectResult::Timeout)
            }
        }
    }

    /// Discover services and map their characteristics
    pub async fn discover_services(&mut self) -> ServiceDiscoveryResult {
        match guarded("discover_services", self.try_discover_services()).await {
            Ok(result) => result,
            Err(e) => {
                error!(device = %self.link.identity, error = %e, "service discovery faulted");
                self.link.slots.service_discovery.disarm();
                self.link.slots.characteristic_discovery.disarm();
                self.link.awaited_service.lock().take();
                self.characteristics.clear();
                ServiceDiscoveryResult::Exception
            }
        }
    }

    async fn try_discover_services(&mut self) -> Result<ServiceDiscoveryResult> {
        self.drop_stale_mapping();
        if !self.is_connected() {
            warn!(device = %self.link.identity, state = %self.state(), "discover_services needs a connection");
            return Ok(ServiceDiscoveryResult::Failure);
        }

        self.characteristics.clear();
        let peripheral = self.peripheral();
        let radio = self.context.radio();
        let timing = &self.context.config().timing;

        let pending = self.link.slots.service_discovery.arm();
        radio.discover_services(&peripheral)?;
        match pending.wait_for(timing.service_discovery_timeout).await {
            Some(DiscoveryOutcome::Ready) => {}
            Some(DiscoveryOutcome::Failed(error)) => {
                warn!(device = %self.link.identity, %error, "service discovery failed");
                return Ok(ServiceDiscoveryResult::Failure);
            }
            None => {
                warn!(device = %self.link.identity, "service discovery timed out");
                return Ok(ServiceDiscoveryResult::Timeout);
            }
        }

        let services = radio.services(&peripheral)?;
        debug!(device = %self.link.identity, count = services.len(), "services discovered");

        let map = self.context.characteristic_map();
        let mut mapping: HashMap<Characteristic, CharacteristicHandle> = HashMap::new();
        for service in &services {
            *self.link.awaited_service.lock() = Some(service.id);
            let pending = self.link.slots.characteristic_discovery.arm();
            radio.discover_characteristics(&peripheral, service)?;
            let outcome = pending.wait_timeout(timing.characteristic_settle_delay).await;
            // a completion arriving after this point belongs to no one
            self.link.awaited_service.lock().take();
            self.link.slots.characteristic_discovery.disarm();
            match outcome {
                Some(DiscoveryOutcome::Ready) => {}
                Some(DiscoveryOutcome::Failed(error)) => {
                    warn!(device = %self.link.identity, service = %service.uuid, %error, "skipping service");
                    continue;
                }
                None => {
                    trace!(device = %self.link.identity, service = %service.uuid, "settle delay elapsed");
                }
            }

            for handle in radio.characteristics(&peripheral, service)? {
                let Some(characteristic) = map.resolve(&handle.uuid) else {
                    debug!(device = %self.link.identity, uuid = %handle.uuid, "unknown characteristic, skipping");
                    continue;
                };
                if let Some(existing) = mapping.get(&characteristic) {
                    debug!(
                        device = %self.link.identity,
                        %characteristic,
                        kept = existing.id,
                        "duplicate characteristic, keeping first"
                    );
                    continue;
                }
                trace!(device = %self.link.identity, %characteristic, id = handle.id, "mapped characteristic");
                mapping.insert(characteristic, handle);
            }
        }

        info!(
            device = %self.link.identity,
            services = services.len(),
            characteristics = mapping.len(),
            "service discovery complete"
        );
        self.characteristics = mapping;
        self.set_state(SessionState::ServicesDiscovered);
        Ok(ServiceDiscoveryResult::Success)
    }

    /// Read a characteristic value
    pub async fn read_characteristic(&mut self, options: ReadOptions) -> ReadResult {
        let characteristic = options.characteristic;
        match guarded("read_characteristic", self.try_read(options)).await {
            Ok(result) => result,
            Err(e) => {
                error!(device = %self.link.identity, %characteristic, error = %e, "read faulted");
                self.link.slots.read.disarm();
                self.forget_read(characteristic);
                ReadResult::empty(ReadStatus::Exception)
            }
        }
    }

    async fn try_read(&mut self, options: ReadOptions) -> Result<ReadResult> {
        self.drop_stale_mapping();
        let Some(handle) = self.characteristics.get(&options.characteristic).cloned() else {
            debug!(device = %self.link.identity, characteristic = %options.characteristic, "not mapped");
            return Ok(ReadResult::empty(ReadStatus::CharacteristicNotFound));
        };

        let pending = self.link.slots.read.arm();
        self.link.reads_in_flight.lock().insert(handle.id);
        self.context.radio().read_value(&self.peripheral(), &handle)?;

        match pending.wait_timeout(options.timeout).await {
            Some(ReadOutcome::Value(data)) => {
                debug!(
                    device = %self.link.identity,
                    characteristic = %options.characteristic,
                    len = data.len(),
                    "read complete"
                );
                Ok(ReadResult::success(data))
            }
            Some(ReadOutcome::Failed(error)) => {
                warn!(device = %self.link.identity, characteristic = %options.characteristic, %error, "read failed");
                Ok(ReadResult::empty(ReadStatus::Failure))
            }
            None => {
                warn!(device = %self.link.identity, characteristic = %options.characteristic, "read timed out");
                self.link.reads_in_flight.lock().remove(&handle.id);
                Ok(ReadResult::empty(ReadStatus::Timeout))
            }
        }
    }

    fn forget_read(&self, characteristic: Characteristic) {
        if let Some(handle) = self.characteristics.get(&characteristic) {
            self.link.reads_in_flight.lock().remove(&handle.id);
        }
    }

    /// Write a characteristic value
    pub async fn write_characteristic(&mut self, options: WriteOptions) -> WriteResult {
        let characteristic = options.characteristic;
        match guarded("write_characteristic", self.try_write(options)).await {
            Ok(result) => result,
            Err(e) => {
                error!(device = %self.link.identity, %characteristic, error = %e, "write faulted");
                self.link.slots.write.disarm();
                WriteResult::Exception
            }
        }
    }

    async fn try_write(&mut self, options: WriteOptions) -> Result<WriteResult> {
        self.drop_stale_mapping();
        let Some(handle) = self.characteristics.get(&options.characteristic) else {
            debug!(device = %self.link.identity, characteristic = %options.characteristic, "not mapped");
            return Ok(WriteResult::CharacteristicNotFound);
        };
        let peripheral = self.peripheral();
        let radio = self.context.radio();

        if !options.with_response {
            radio.write_value(
                &peripheral,
                handle,
                &options.data,
                WriteMode::WithoutResponse,
            )?;
            trace!(device = %self.link.identity, characteristic = %options.characteristic, len = options.data.len(), "write without response issued");
            return Ok(WriteResult::Success);
        }

        let pending = self.link.slots.write.arm();
        radio.write_value(&peripheral, handle, &options.data, WriteMode::WithResponse)?;

        match pending.wait_timeout(options.timeout).await {
            Some(WriteOutcome::Acknowledged) => {
                debug!(device = %self.link.identity, characteristic = %options.characteristic, len = options.data.len(), "write acknowledged");
                Ok(WriteResult::Success)
            }
            Some(WriteOutcome::Failed(error)) => {
                warn!(device = %self.link.identity, characteristic = %options.characteristic, %error, "write failed");
                Ok(WriteResult::Failure)
            }
            None => {
                warn!(device = %self.link.identity, characteristic = %options.characteristic, "write timed out");
                Ok(WriteResult::Timeout)
            }
        }
    }

    /// Tear down the link
    ///
    /// A session that never connected, or already lost its link, reports
    /// `Disconnected` without a native call.
    pub async fn disconnect(&mut self) -> DisconnectResult {
        match guarded("disconnect", self.try_disconnect()).await {
            Ok(result) => result,
            Err(e) => {
                error!(device = %self.link.identity, error = %e, "disconnect faulted");
                self.link.slots.disconnect.disarm();
                DisconnectResult::Exception
            }
        }
    }

    async fn try_disconnect(&mut self) -> Result<DisconnectResult> {
        if matches!(self.state(), SessionState::Idle | SessionState::Disconnected) {
            self.characteristics.clear();
            return Ok(DisconnectResult::Disconnected);
        }

        info!(device = %self.link.identity, "disconnecting");
        let pending = self.link.slots.disconnect.arm();
        self.context.radio().cancel_connection(&self.peripheral())?;

        match pending.wait_for(self.context.config().timing.disconnect_timeout).await {
            Some(DisconnectOutcome::Disconnected) => {
                self.characteristics.clear();
                self.link.reads_in_flight.lock().clear();
                self.set_state(SessionState::Disconnected);
                info!(device = %self.link.identity, "disconnected");
                Ok(DisconnectResult::Disconnected)
            }
            Some(DisconnectOutcome::Failed(error)) => {
                warn!(device = %self.link.identity, %error, "disconnect failed");
                Ok(DisconnectResult::Failure)
            }
            None => {
                warn!(device = %self.link.identity, "disconnect timed out");
                Ok(DisconnectResult::Timeout)
            }
        }
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("identity", &self.link.identity)
            .field("name", &self.name())
            .field("state", &self.state())
            .field("characteristics", &self.characteristics())
            .finish()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.context.adapter().detach(&self.link);
        if self.is_connected() {
            debug!(device = %self.link.identity, "session dropped while connected");
        }
    }
}
