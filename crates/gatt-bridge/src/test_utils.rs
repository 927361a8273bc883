//! Simulated radio and fixtures for tests and demos
//!
//! [`SimulatedRadio`] stands in for a native BLE stack. It keeps a list of
//! scripted peripherals and answers every fire-and-forget call the way a real
//! stack would: later, from a spawned task, through the
//! [`CallbackAdapter`]. Each call is recorded so tests can assert on what the
//! bridge actually asked the radio to do.
//!
//! # Example
//!
//! ```rust,ignore
//! use gatt_bridge::test_utils::{SimulatedPeripheral, TestFixture};
//!
//! #[tokio::test(start_paused = true)]
//! async fn reads_battery() {
//!     let fixture = TestFixture::new();
//!     let mut session = fixture
//!         .connected_session(
//!             SimulatedPeripheral::new("dev-1", Some("Thermo"))
//!                 .with_service("180F", &["2A19"])
//!                 .with_value("2A19", &[87]),
//!         )
//!         .await;
//!
//!     let result = session
//!         .read_characteristic(ReadOptions::new(Characteristic::BatteryLevel))
//!         .await;
//!     assert_eq!(&result.data[..], &[87]);
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::adapter::{CallbackAdapter, DiscoveredDevice};
use crate::characteristic::normalize_uuid;
use crate::config::BridgeConfig;
use crate::context::BridgeContext;
use crate::error::{BridgeError, Result};
use crate::models::{ConnectResult, ServiceDiscoveryResult};
use crate::radio::{
    Advertisement, CharacteristicHandle, ConnectionOptions, DeviceIdentity, NativeRadio,
    PeripheralHandle, PowerState, ScanFilter, ServiceHandle, WriteMode,
};
use crate::scan::Scanner;
use crate::session::DeviceSession;

/// Default delay before a simulated callback fires
pub const DEFAULT_SIMULATED_LATENCY: Duration = Duration::from_millis(10);

/// How a simulated peripheral answers one kind of call
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Response {
    /// Report success
    #[default]
    Succeed,
    /// Report a native error
    Fail(String),
    /// Never call back
    Silent,
}

/// Native radio primitives, for scripting responses and faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioOp {
    /// `initialize`
    Initialize,
    /// `connect`
    Connect,
    /// `cancel_connection`
    CancelConnection,
    /// `discover_services`
    DiscoverServices,
    /// `services`
    Services,
    /// `discover_characteristics`
    DiscoverCharacteristics,
    /// `characteristics`
    Characteristics,
    /// `read_value`
    ReadValue,
    /// `write_value`
    WriteValue,
    /// `start_scan`
    StartScan,
    /// `stop_scan`
    StopScan,
}

/// A call the bridge issued to the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    /// Radio initialized
    Initialize,
    /// Connect requested
    Connect(DeviceIdentity),
    /// Connection cancelled
    CancelConnection(DeviceIdentity),
    /// Service discovery requested
    DiscoverServices(DeviceIdentity),
    /// Characteristic discovery requested for one service
    DiscoverCharacteristics {
        /// Target device
        device: DeviceIdentity,
        /// Service UUID
        service: String,
    },
    /// Read requested
    ReadValue {
        /// Target device
        device: DeviceIdentity,
        /// Characteristic UUID
        uuid: String,
    },
    /// Write issued
    WriteValue {
        /// Target device
        device: DeviceIdentity,
        /// Characteristic UUID
        uuid: String,
        /// Payload
        data: Bytes,
        /// Requested mode
        mode: WriteMode,
    },
    /// Scan started
    StartScan(ScanFilter),
    /// Scan stopped
    StopScan,
}

/// Scripted peripheral
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    identity: DeviceIdentity,
    advertisement: Advertisement,
    services: Vec<(String, Vec<String>)>,
    values: HashMap<String, Bytes>,
    responses: HashMap<RadioOp, Response>,
}

fn uuid_key(uuid: &str) -> String {
    normalize_uuid(uuid).unwrap_or_else(|_| uuid.to_uppercase())
}

impl SimulatedPeripheral {
    /// Peripheral advertising `name` (or nothing) with no services
    pub fn new(identity: impl Into<DeviceIdentity>, name: Option<&str>) -> Self {
        Self {
            identity: identity.into(),
            advertisement: Advertisement {
                local_name: name.map(str::to_string),
                manufacturer_data: Bytes::new(),
                service_uuids: Vec::new(),
                rssi: Some(-58),
            },
            services: Vec::new(),
            values: HashMap::new(),
            responses: HashMap::new(),
        }
    }

    /// Native identity
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Advertisement delivered while scanning
    pub fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    /// Set the advertised signal strength
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.advertisement.rssi = Some(rssi);
        self
    }

    /// Set advertised manufacturer data
    pub fn with_manufacturer_data(mut self, data: &[u8]) -> Self {
        self.advertisement.manufacturer_data = Bytes::copy_from_slice(data);
        self
    }

    /// Advertise a service UUID
    pub fn advertising_service(mut self, uuid: &str) -> Self {
        self.advertisement.service_uuids.push(uuid.to_string());
        self
    }

    /// Add a GATT service with the given characteristic UUIDs
    pub fn with_service(mut self, uuid: &str, characteristics: &[&str]) -> Self {
        self.services.push((
            uuid.to_string(),
            characteristics.iter().map(|c| c.to_string()).collect(),
        ));
        self
    }

    /// Value returned when `uuid` is read
    pub fn with_value(mut self, uuid: &str, value: &[u8]) -> Self {
        self.values.insert(uuid_key(uuid), Bytes::copy_from_slice(value));
        self
    }

    /// Answer connects with `response`
    pub fn connect_response(self, response: Response) -> Self {
        self.respond(RadioOp::Connect, response)
    }

    /// Answer disconnects with `response`
    pub fn disconnect_response(self, response: Response) -> Self {
        self.respond(RadioOp::CancelConnection, response)
    }

    /// Answer service discovery with `response`
    pub fn discovery_response(self, response: Response) -> Self {
        self.respond(RadioOp::DiscoverServices, response)
    }

    /// Answer reads with `response`
    pub fn read_response(self, response: Response) -> Self {
        self.respond(RadioOp::ReadValue, response)
    }

    /// Answer writes with response with `response`
    pub fn write_response(self, response: Response) -> Self {
        self.respond(RadioOp::WriteValue, response)
    }

    /// Answer `op` with `response`
    pub fn respond(mut self, op: RadioOp, response: Response) -> Self {
        self.responses.insert(op, response);
        self
    }

    fn response(&self, op: RadioOp) -> Response {
        self.responses.get(&op).cloned().unwrap_or_default()
    }

    fn advertises_any(&self, filter: &ScanFilter) -> bool {
        filter.service_uuids.is_empty()
            || filter.service_uuids.iter().any(|wanted| {
                let wanted = uuid_key(wanted);
                self.advertisement
                    .service_uuids
                    .iter()
                    .any(|offered| uuid_key(offered) == wanted)
            })
    }
}

/// Peripherals used by the command-line node's `--simulated` mode
pub fn demo_peripherals() -> Vec<SimulatedPeripheral> {
    vec![
        SimulatedPeripheral::new("5C3A1F02-7E44-4B7A-9B7D-2F1C0E9A4D11", Some("Thermo Sensor"))
            .with_rssi(-52)
            .with_manufacturer_data(&[0x59, 0x00, 0x01, 0x17])
            .advertising_service("180F")
            .with_service("1800", &["2A00", "2A01"])
            .with_service("180F", &["2A19"])
            .with_service("180A", &["2A29", "2A24", "2A25", "2A26"])
            .with_service("A0E1B2C3-0000-4000-8000-00805F9B34FB", &["A0E1B2C4-0000-4000-8000-00805F9B34FB"])
            .with_value("2A00", b"Thermo Sensor")
            .with_value("2A01", &[0x00, 0x03])
            .with_value("2A19", &[87])
            .with_value("2A29", b"Acme Instruments")
            .with_value("2A24", b"TS-100")
            .with_value("2A25", b"TS100-004521")
            .with_value("2A26", b"1.4.2"),
        SimulatedPeripheral::new("9D0B6E21-15C8-4F3E-A2D6-7B58C3F0E812", Some("UART Bridge"))
            .with_rssi(-67)
            .with_service(
                "6E400001-B5A3-F393-E0A9-E50E24DCCA9E",
                &[
                    "6E400002-B5A3-F393-E0A9-E50E24DCCA9E",
                    "6E400003-B5A3-F393-E0A9-E50E24DCCA9E",
                ],
            )
            .with_service("180A", &["2A29", "2A27", "2A28"])
            .with_value("2A29", b"Nordic Semiconductor")
            .with_value("2A27", b"rev C")
            .with_value("2A28", b"2.0.1")
            .with_value("6E400003-B5A3-F393-E0A9-E50E24DCCA9E", b"ready\n"),
        SimulatedPeripheral::new("E2C56DB5-DFFB-48D2-B060-D0F5A71096E0", None)
            .with_rssi(-88)
            .with_manufacturer_data(&[0x4C, 0x00, 0x02, 0x15]),
    ]
}

struct PeripheralEntry {
    profile: SimulatedPeripheral,
    services: Vec<(ServiceHandle, Vec<CharacteristicHandle>)>,
    written: Vec<Bytes>,
}

impl PeripheralEntry {
    fn new(profile: SimulatedPeripheral) -> Self {
        let mut next_id = 1u64;
        let mut services = Vec::with_capacity(profile.services.len());
        for (service_uuid, characteristic_uuids) in &profile.services {
            let service = ServiceHandle {
                id: next_id,
                uuid: service_uuid.clone(),
            };
            next_id += 1;
            let characteristics = characteristic_uuids
                .iter()
                .map(|uuid| {
                    let handle = CharacteristicHandle {
                        id: next_id,
                        uuid: uuid.clone(),
                    };
                    next_id += 1;
                    handle
                })
                .collect();
            services.push((service, characteristics));
        }
        Self {
            profile,
            services,
            written: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Fail,
    Panic,
}

struct SimState {
    configured_power: PowerState,
    reported_power: PowerState,
    initialized: bool,
    scanning: bool,
    reports_characteristic_discovery: bool,
    latency: Duration,
    peripherals: Vec<PeripheralEntry>,
    calls: Vec<RadioCall>,
    faults: HashMap<RadioOp, Fault>,
}

impl SimState {
    fn peripheral(&self, identity: &DeviceIdentity) -> Result<&PeripheralEntry> {
        self.peripherals
            .iter()
            .find(|p| &p.profile.identity == identity)
            .ok_or_else(|| BridgeError::UnknownPeripheral(identity.to_string()))
    }

    fn peripheral_mut(&mut self, identity: &DeviceIdentity) -> Result<&mut PeripheralEntry> {
        self.peripherals
            .iter_mut()
            .find(|p| &p.profile.identity == identity)
            .ok_or_else(|| BridgeError::UnknownPeripheral(identity.to_string()))
    }
}

struct SimInner {
    adapter: Arc<CallbackAdapter>,
    state: Mutex<SimState>,
    instances: AtomicU64,
}

/// Scriptable in-process BLE stack
///
/// Clones share the same simulated stack.
#[derive(Clone)]
pub struct SimulatedRadio {
    inner: Arc<SimInner>,
}

impl SimulatedRadio {
    /// Create a powered-on radio reporting into `adapter`
    pub fn new(adapter: Arc<CallbackAdapter>) -> Self {
        Self {
            inner: Arc::new(SimInner {
                adapter,
                state: Mutex::new(SimState {
                    configured_power: PowerState::PoweredOn,
                    reported_power: PowerState::Unknown,
                    initialized: false,
                    scanning: false,
                    reports_characteristic_discovery: true,
                    latency: DEFAULT_SIMULATED_LATENCY,
                    peripherals: Vec::new(),
                    calls: Vec::new(),
                    faults: HashMap::new(),
                }),
                instances: AtomicU64::new(0),
            }),
        }
    }

    /// Adapter callbacks are delivered to
    pub fn adapter(&self) -> &Arc<CallbackAdapter> {
        &self.inner.adapter
    }

    // ===== Scripting =====

    /// Make a peripheral visible to scans and connects
    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        let mut state = self.inner.state.lock();
        state
            .peripherals
            .retain(|p| p.profile.identity != peripheral.identity);
        state.peripherals.push(PeripheralEntry::new(peripheral));
    }

    /// Take a peripheral out of range
    pub fn remove_peripheral(&self, identity: impl Into<DeviceIdentity>) {
        let identity = identity.into();
        self.inner
            .state
            .lock()
            .peripherals
            .retain(|p| p.profile.identity != identity);
    }

    /// Change how a known peripheral answers `op`
    pub fn set_response(&self, identity: impl Into<DeviceIdentity>, op: RadioOp, response: Response) {
        let identity = identity.into();
        if let Ok(entry) = self.inner.state.lock().peripheral_mut(&identity) {
            entry.profile.responses.insert(op, response);
        }
    }

    /// Power state reported on initialization, and immediately if already initialized
    pub fn set_power_state(&self, power: PowerState) {
        let report = {
            let mut state = self.inner.state.lock();
            state.configured_power = power;
            if state.initialized {
                state.reported_power = power;
            }
            state.initialized
        };
        if report {
            self.inner.adapter.on_state_updated(power);
        }
    }

    /// Delay before each callback fires
    pub fn set_latency(&self, latency: Duration) {
        self.inner.state.lock().latency = latency;
    }

    /// Whether characteristic discovery reports completion; when off the
    /// bridge has to fall back to its settle delay
    pub fn set_reports_characteristic_discovery(&self, reports: bool) {
        self.inner.state.lock().reports_characteristic_discovery = reports;
    }

    /// Make the next call of `op` return a native fault
    pub fn fail_next(&self, op: RadioOp) {
        self.inner.state.lock().faults.insert(op, Fault::Fail);
    }

    /// Make the next call of `op` panic
    pub fn panic_next(&self, op: RadioOp) {
        self.inner.state.lock().faults.insert(op, Fault::Panic);
    }

    /// Drop an established link without being asked to
    pub fn drop_link(&self, identity: impl Into<DeviceIdentity>, reason: &str) {
        let identity = identity.into();
        debug!(device = %identity, reason, "simulating link loss");
        self.inner
            .adapter
            .on_disconnected(&identity, Some(reason.to_string()));
    }

    /// Push an unsolicited value, as a notification would
    pub fn notify(&self, identity: impl Into<DeviceIdentity>, uuid: &str, value: &[u8]) {
        let identity = identity.into();
        let handle = {
            let state = self.inner.state.lock();
            let wanted = uuid_key(uuid);
            state.peripheral(&identity).ok().and_then(|entry| {
                entry
                    .services
                    .iter()
                    .flat_map(|(_, chars)| chars.iter())
                    .find(|c| uuid_key(&c.uuid) == wanted)
                    .cloned()
            })
        };
        if let Some(handle) = handle {
            self.inner.adapter.on_characteristic_value(
                &identity,
                &handle,
                Bytes::copy_from_slice(value),
                None,
            );
        }
    }

    // ===== Inspection =====

    /// Every call issued so far
    pub fn calls(&self) -> Vec<RadioCall> {
        self.inner.state.lock().calls.clone()
    }

    /// Number of recorded calls matching `predicate`
    pub fn count(&self, predicate: impl Fn(&RadioCall) -> bool) -> usize {
        self.inner.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Payloads written to a peripheral, in order
    pub fn written(&self, identity: impl Into<DeviceIdentity>) -> Vec<Bytes> {
        let identity = identity.into();
        self.inner
            .state
            .lock()
            .peripheral(&identity)
            .map(|entry| entry.written.clone())
            .unwrap_or_default()
    }

    /// Whether a scan is running
    pub fn is_scanning(&self) -> bool {
        self.inner.state.lock().scanning
    }

    // ===== Internals =====

    /// Record a call and apply any scripted fault
    fn begin(&self, op: RadioOp, call: Option<RadioCall>) -> Result<()> {
        let fault = {
            let mut state = self.inner.state.lock();
            if let Some(call) = call {
                trace!(?call, "radio call");
                state.calls.push(call);
            }
            state.faults.remove(&op)
        };
        match fault {
            None => Ok(()),
            Some(Fault::Fail) => Err(BridgeError::Native(format!("simulated {op:?} fault"))),
            Some(Fault::Panic) => panic!("simulated {op:?} panic"),
        }
    }

    fn response(&self, identity: &DeviceIdentity, op: RadioOp) -> Result<Response> {
        Ok(self.inner.state.lock().peripheral(identity)?.profile.response(op))
    }

    /// Run `callback` against the adapter after the configured latency
    fn deliver<F>(&self, callback: F)
    where
        F: FnOnce(&SimInner) + Send + 'static,
    {
        let inner = self.inner.clone();
        let latency = inner.state.lock().latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            callback(&inner);
        });
    }
}

impl fmt::Debug for SimulatedRadio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SimulatedRadio")
            .field("power", &state.reported_power)
            .field("peripherals", &state.peripherals.len())
            .field("calls", &state.calls.len())
            .finish()
    }
}

impl NativeRadio for SimulatedRadio {
    fn initialize(&self) -> Result<()> {
        self.begin(RadioOp::Initialize, Some(RadioCall::Initialize))?;
        self.inner.state.lock().initialized = true;
        self.deliver(|inner| {
            let power = {
                let mut state = inner.state.lock();
                state.reported_power = state.configured_power;
                state.reported_power
            };
            inner.adapter.on_state_updated(power);
        });
        Ok(())
    }

    fn power_state(&self) -> PowerState {
        self.inner.state.lock().reported_power
    }

    fn connect(&self, peripheral: &PeripheralHandle, _options: &ConnectionOptions) -> Result<()> {
        let identity = peripheral.identity.clone();
        self.begin(RadioOp::Connect, Some(RadioCall::Connect(identity.clone())))?;
        let instance = self.inner.instances.fetch_add(1, Ordering::Relaxed) + 1;
        match self.response(&identity, RadioOp::Connect)? {
            Response::Succeed => self.deliver(move |inner| {
                let handle = PeripheralHandle::new(identity.clone(), instance);
                inner.adapter.on_connected(&identity, handle);
            }),
            Response::Fail(error) => {
                self.deliver(move |inner| inner.adapter.on_connect_failed(&identity, error))
            }
            Response::Silent => {}
        }
        Ok(())
    }

    fn cancel_connection(&self, peripheral: &PeripheralHandle) -> Result<()> {
        let identity = peripheral.identity.clone();
        self.begin(
            RadioOp::CancelConnection,
            Some(RadioCall::CancelConnection(identity.clone())),
        )?;
        match self.response(&identity, RadioOp::CancelConnection)? {
            Response::Succeed => {
                self.deliver(move |inner| inner.adapter.on_disconnected(&identity, None))
            }
            Response::Fail(error) => {
                self.deliver(move |inner| inner.adapter.on_disconnected(&identity, Some(error)))
            }
            Response::Silent => {}
        }
        Ok(())
    }

    fn discover_services(&self, peripheral: &PeripheralHandle) -> Result<()> {
        let identity = peripheral.identity.clone();
        self.begin(
            RadioOp::DiscoverServices,
            Some(RadioCall::DiscoverServices(identity.clone())),
        )?;
        match self.response(&identity, RadioOp::DiscoverServices)? {
            Response::Succeed => {
                self.deliver(move |inner| inner.adapter.on_services_ready(&identity, None))
            }
            Response::Fail(error) => {
                self.deliver(move |inner| inner.adapter.on_services_ready(&identity, Some(error)))
            }
            Response::Silent => {}
        }
        Ok(())
    }

    fn services(&self, peripheral: &PeripheralHandle) -> Result<Vec<ServiceHandle>> {
        self.begin(RadioOp::Services, None)?;
        let state = self.inner.state.lock();
        let entry = state.peripheral(&peripheral.identity)?;
        Ok(entry.services.iter().map(|(s, _)| s.clone()).collect())
    }

    fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
    ) -> Result<()> {
        let identity = peripheral.identity.clone();
        self.begin(
            RadioOp::DiscoverCharacteristics,
            Some(RadioCall::DiscoverCharacteristics {
                device: identity.clone(),
                service: service.uuid.clone(),
            }),
        )?;
        if !self.inner.state.lock().reports_characteristic_discovery {
            return Ok(());
        }
        let service = service.clone();
        match self.response(&identity, RadioOp::DiscoverCharacteristics)? {
            Response::Succeed => self.deliver(move |inner| {
                inner
                    .adapter
                    .on_characteristics_ready(&identity, &service, None)
            }),
            Response::Fail(error) => self.deliver(move |inner| {
                inner
                    .adapter
                    .on_characteristics_ready(&identity, &service, Some(error))
            }),
            Response::Silent => {}
        }
        Ok(())
    }

    fn characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
    ) -> Result<Vec<CharacteristicHandle>> {
        self.begin(RadioOp::Characteristics, None)?;
        let state = self.inner.state.lock();
        let entry = state.peripheral(&peripheral.identity)?;
        Ok(entry
            .services
            .iter()
            .find(|(s, _)| s.id == service.id)
            .map(|(_, chars)| chars.clone())
            .unwrap_or_default())
    }

    fn read_value(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
    ) -> Result<()> {
        let identity = peripheral.identity.clone();
        self.begin(
            RadioOp::ReadValue,
            Some(RadioCall::ReadValue {
                device: identity.clone(),
                uuid: characteristic.uuid.clone(),
            }),
        )?;
        let (response, value) = {
            let state = self.inner.state.lock();
            let entry = state.peripheral(&identity)?;
            let value = entry
                .profile
                .values
                .get(&uuid_key(&characteristic.uuid))
                .cloned()
                .unwrap_or_default();
            (entry.profile.response(RadioOp::ReadValue), value)
        };
        let characteristic = characteristic.clone();
        match response {
            Response::Succeed => self.deliver(move |inner| {
                inner
                    .adapter
                    .on_characteristic_value(&identity, &characteristic, value, None)
            }),
            Response::Fail(error) => self.deliver(move |inner| {
                inner.adapter.on_characteristic_value(
                    &identity,
                    &characteristic,
                    Bytes::new(),
                    Some(error),
                )
            }),
            Response::Silent => {}
        }
        Ok(())
    }

    fn write_value(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let identity = peripheral.identity.clone();
        let data = Bytes::copy_from_slice(data);
        self.begin(
            RadioOp::WriteValue,
            Some(RadioCall::WriteValue {
                device: identity.clone(),
                uuid: characteristic.uuid.clone(),
                data: data.clone(),
                mode,
            }),
        )?;
        let response = {
            let mut state = self.inner.state.lock();
            let entry = state.peripheral_mut(&identity)?;
            entry.written.push(data);
            entry.profile.response(RadioOp::WriteValue)
        };
        if mode == WriteMode::WithoutResponse {
            return Ok(());
        }
        let characteristic = characteristic.clone();
        match response {
            Response::Succeed => self.deliver(move |inner| {
                inner
                    .adapter
                    .on_characteristic_written(&identity, &characteristic, None)
            }),
            Response::Fail(error) => self.deliver(move |inner| {
                inner
                    .adapter
                    .on_characteristic_written(&identity, &characteristic, Some(error))
            }),
            Response::Silent => {}
        }
        Ok(())
    }

    fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        self.begin(RadioOp::StartScan, Some(RadioCall::StartScan(filter.clone())))?;
        let advertising: Vec<(DeviceIdentity, Advertisement)> = {
            let mut state = self.inner.state.lock();
            state.scanning = true;
            state
                .peripherals
                .iter()
                .filter(|p| p.profile.advertises_any(filter))
                .map(|p| (p.profile.identity.clone(), p.profile.advertisement.clone()))
                .collect()
        };
        self.deliver(move |inner| {
            // real stacks repeat advertisements; the adapter deduplicates
            for _ in 0..2 {
                for (identity, advertisement) in &advertising {
                    if !inner.state.lock().scanning {
                        return;
                    }
                    inner
                        .adapter
                        .on_discovered(identity.clone(), advertisement.clone());
                }
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        self.begin(RadioOp::StopScan, Some(RadioCall::StopScan))?;
        self.inner.state.lock().scanning = false;
        Ok(())
    }
}

/// Test fixture wiring a [`SimulatedRadio`] into a [`BridgeContext`]
pub struct TestFixture {
    /// Shared context
    pub context: Arc<BridgeContext>,
    /// The simulated stack behind the context
    pub radio: SimulatedRadio,
}

impl TestFixture {
    /// Fixture with default configuration
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    /// Fixture with a custom configuration
    ///
    /// # Panics
    ///
    /// Panics if `config` does not validate.
    pub fn with_config(config: BridgeConfig) -> Self {
        let adapter = Arc::new(CallbackAdapter::from_config(&config.discovery));
        let radio = SimulatedRadio::new(adapter.clone());
        let context = BridgeContext::from_parts(config, adapter, Arc::new(radio.clone()))
            .expect("test configuration must validate");
        Self { context, radio }
    }

    /// Fixture pre-loaded with [`demo_peripherals`]
    pub fn demo() -> Self {
        let fixture = Self::new();
        for peripheral in demo_peripherals() {
            fixture.radio.add_peripheral(peripheral);
        }
        fixture
    }

    /// Scanner over the fixture's context
    pub fn scanner(&self) -> Scanner {
        Scanner::new(self.context.clone())
    }

    /// Add `peripheral` to the radio and open a session on it without scanning
    pub fn session_for(&self, peripheral: SimulatedPeripheral) -> DeviceSession {
        let device = DiscoveredDevice {
            identity: peripheral.identity.clone(),
            advertisement: peripheral.advertisement.clone(),
            discovered_at: Utc::now(),
        };
        self.radio.add_peripheral(peripheral);
        DeviceSession::new(self.context.clone(), device)
    }

    /// Session that has connected and discovered services
    ///
    /// # Panics
    ///
    /// Panics if connect or discovery does not succeed.
    pub async fn connected_session(&self, peripheral: SimulatedPeripheral) -> DeviceSession {
        let mut session = self.session_for(peripheral);
        assert_eq!(session.connect().await, ConnectResult::Connected);
        assert_eq!(
            session.discover_services().await,
            ServiceDiscoveryResult::Success
        );
        session
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}
