//! Native radio backed by `btleplug`
//!
//! `btleplug` exposes an async API; the bridge expects fire-and-forget calls
//! that report back through callbacks. Every call here spawns a task on the
//! runtime the radio was created on, awaits the `btleplug` future and hands
//! the outcome to the [`CallbackAdapter`].
//!
//! # Requirements
//!
//! Enable the `ble` feature in Cargo.toml to use this radio.
//!
//! On Linux, you'll also need:
//! ```bash
//! apt install libdbus-1-dev
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use ::btleplug::api::{
    Central, CentralEvent, Characteristic as GattCharacteristic, Manager as _, Peripheral as _,
    ScanFilter as GattScanFilter, Service as GattService, WriteType,
};
use ::btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{
    Advertisement, CharacteristicHandle, ConnectionOptions, DeviceIdentity, NativeRadio,
    PeripheralHandle, PowerState, ScanFilter, ServiceHandle, WriteMode,
};
use crate::adapter::CallbackAdapter;
use crate::characteristic::normalize_uuid;
use crate::error::{BridgeError, Result};

/// Known peripheral and the handles issued for it
struct PeripheralEntry {
    peripheral: Peripheral,
    services: Vec<(ServiceHandle, GattService)>,
    characteristics: HashMap<u64, GattCharacteristic>,
    next_handle: u64,
}

impl PeripheralEntry {
    fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            services: Vec::new(),
            characteristics: HashMap::new(),
            next_handle: 1,
        }
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }
}

#[derive(Default)]
struct RadioState {
    power: PowerState,
    peripherals: HashMap<DeviceIdentity, PeripheralEntry>,
    events_started: bool,
}

/// [`NativeRadio`] over the first adapter `btleplug` finds
pub struct BtleplugRadio {
    adapter: Option<Adapter>,
    runtime: Handle,
    callbacks: Arc<CallbackAdapter>,
    state: Arc<Mutex<RadioState>>,
}

impl BtleplugRadio {
    /// Open the first Bluetooth adapter
    ///
    /// A host without an adapter still yields a radio; it reports
    /// [`PowerState::Unsupported`] once initialized. Must be called from
    /// within a tokio runtime.
    pub async fn new(callbacks: Arc<CallbackAdapter>) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next();
        match &adapter {
            Some(adapter) => {
                let info = adapter.adapter_info().await.unwrap_or_default();
                info!(adapter = %info, "using bluetooth adapter");
            }
            None => warn!("no bluetooth adapter found"),
        }
        Ok(Self {
            adapter,
            runtime: Handle::current(),
            callbacks,
            state: Arc::new(Mutex::new(RadioState::default())),
        })
    }

    fn adapter(&self) -> Result<&Adapter> {
        self.adapter.as_ref().ok_or(BridgeError::NoAdapter)
    }

    fn peripheral(&self, identity: &DeviceIdentity) -> Result<Peripheral> {
        self.state
            .lock()
            .peripherals
            .get(identity)
            .map(|entry| entry.peripheral.clone())
            .ok_or_else(|| BridgeError::UnknownPeripheral(identity.to_string()))
    }

    fn characteristic(
        &self,
        identity: &DeviceIdentity,
        handle: &CharacteristicHandle,
    ) -> Result<(Peripheral, GattCharacteristic)> {
        let state = self.state.lock();
        let entry = state
            .peripherals
            .get(identity)
            .ok_or_else(|| BridgeError::UnknownPeripheral(identity.to_string()))?;
        let characteristic = entry.characteristics.get(&handle.id).cloned().ok_or(
            BridgeError::UnknownCharacteristicHandle {
                device: identity.to_string(),
                handle: handle.id,
            },
        )?;
        Ok((entry.peripheral.clone(), characteristic))
    }

    fn report_power(&self, power: PowerState) {
        self.state.lock().power = power;
        self.callbacks.on_state_updated(power);
    }

    /// Forward adapter events to the callback adapter
    fn spawn_event_pump(&self, adapter: Adapter) {
        let callbacks = self.callbacks.clone();
        let state = self.state.clone();
        self.runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "failed to subscribe to adapter events");
                    return;
                }
            };
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        discovered(&adapter, &callbacks, &state, id).await;
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let identity = DeviceIdentity::new(id.to_string());
                        callbacks.on_disconnected(&identity, None);
                    }
                    other => trace!(event = ?other, "adapter event"),
                }
            }
            debug!("adapter event stream ended");
        });
    }
}

async fn discovered(
    adapter: &Adapter,
    callbacks: &CallbackAdapter,
    state: &Mutex<RadioState>,
    id: PeripheralId,
) {
    let peripheral = match adapter.peripheral(&id).await {
        Ok(peripheral) => peripheral,
        Err(e) => {
            trace!(error = %e, "discovered peripheral vanished");
            return;
        }
    };
    let properties = match peripheral.properties().await {
        Ok(Some(properties)) => properties,
        Ok(None) => return,
        Err(e) => {
            trace!(error = %e, "no properties for peripheral");
            return;
        }
    };

    let identity = DeviceIdentity::new(id.to_string());
    let mut manufacturer: Vec<_> = properties.manufacturer_data.into_iter().collect();
    manufacturer.sort_by_key(|(company, _)| *company);
    let manufacturer_data = manufacturer
        .into_iter()
        .next()
        .map(|(company, data)| {
            let mut raw = company.to_le_bytes().to_vec();
            raw.extend_from_slice(&data);
            Bytes::from(raw)
        })
        .unwrap_or_default();
    let advertisement = Advertisement {
        local_name: properties.local_name,
        manufacturer_data,
        service_uuids: properties
            .services
            .iter()
            .map(|uuid| uuid.hyphenated().to_string().to_uppercase())
            .collect(),
        rssi: properties.rssi,
    };

    state
        .lock()
        .peripherals
        .entry(identity.clone())
        .or_insert_with(|| PeripheralEntry::new(peripheral));
    callbacks.on_discovered(identity, advertisement);
}

impl NativeRadio for BtleplugRadio {
    fn initialize(&self) -> Result<()> {
        let Some(adapter) = self.adapter.clone() else {
            self.report_power(PowerState::Unsupported);
            return Ok(());
        };
        let start_pump = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.events_started, true)
        };
        if start_pump {
            self.spawn_event_pump(adapter);
        }
        self.report_power(PowerState::PoweredOn);
        Ok(())
    }

    fn power_state(&self) -> PowerState {
        self.state.lock().power
    }

    fn connect(&self, peripheral: &PeripheralHandle, _options: &ConnectionOptions) -> Result<()> {
        let identity = peripheral.identity.clone();
        let instance = peripheral.instance + 1;
        let native = self.peripheral(&identity)?;
        let callbacks = self.callbacks.clone();
        self.runtime.spawn(async move {
            match native.connect().await {
                Ok(()) => {
                    let handle = PeripheralHandle::new(identity.clone(), instance);
                    callbacks.on_connected(&identity, handle);
                }
                Err(e) => callbacks.on_connect_failed(&identity, e.to_string()),
            }
        });
        Ok(())
    }

    fn cancel_connection(&self, peripheral: &PeripheralHandle) -> Result<()> {
        let identity = peripheral.identity.clone();
        let native = self.peripheral(&identity)?;
        let callbacks = self.callbacks.clone();
        self.runtime.spawn(async move {
            let error = native.disconnect().await.err().map(|e| e.to_string());
            callbacks.on_disconnected(&identity, error);
        });
        Ok(())
    }

    fn discover_services(&self, peripheral: &PeripheralHandle) -> Result<()> {
        let identity = peripheral.identity.clone();
        let native = self.peripheral(&identity)?;
        let callbacks = self.callbacks.clone();
        let state = self.state.clone();
        self.runtime.spawn(async move {
            if let Err(e) = native.discover_services().await {
                callbacks.on_services_ready(&identity, Some(e.to_string()));
                return;
            }
            {
                let mut state = state.lock();
                if let Some(entry) = state.peripherals.get_mut(&identity) {
                    entry.services.clear();
                    entry.characteristics.clear();
                    for service in native.services() {
                        let handle = ServiceHandle {
                            id: entry.allocate(),
                            uuid: service.uuid.hyphenated().to_string().to_uppercase(),
                        };
                        entry.services.push((handle, service));
                    }
                }
            }
            callbacks.on_services_ready(&identity, None);
        });
        Ok(())
    }

    fn services(&self, peripheral: &PeripheralHandle) -> Result<Vec<ServiceHandle>> {
        let state = self.state.lock();
        let entry = state
            .peripherals
            .get(&peripheral.identity)
            .ok_or_else(|| BridgeError::UnknownPeripheral(peripheral.identity.to_string()))?;
        Ok(entry.services.iter().map(|(handle, _)| handle.clone()).collect())
    }

    fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
    ) -> Result<()> {
        // btleplug discovers characteristics together with their services
        self.callbacks
            .on_characteristics_ready(&peripheral.identity, service, None);
        Ok(())
    }

    fn characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
    ) -> Result<Vec<CharacteristicHandle>> {
        let mut state = self.state.lock();
        let entry = state
            .peripherals
            .get_mut(&peripheral.identity)
            .ok_or_else(|| BridgeError::UnknownPeripheral(peripheral.identity.to_string()))?;
        let Some(gatt) = entry
            .services
            .iter()
            .find(|(handle, _)| handle.id == service.id)
            .map(|(_, gatt)| gatt.characteristics.clone())
        else {
            return Ok(Vec::new());
        };

        let mut handles = Vec::with_capacity(gatt.len());
        for characteristic in gatt {
            let handle = CharacteristicHandle {
                id: entry.allocate(),
                uuid: characteristic.uuid.hyphenated().to_string().to_uppercase(),
            };
            entry.characteristics.insert(handle.id, characteristic);
            handles.push(handle);
        }
        Ok(handles)
    }

    fn read_value(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
    ) -> Result<()> {
        let identity = peripheral.identity.clone();
        let (native, gatt) = self.characteristic(&identity, characteristic)?;
        let callbacks = self.callbacks.clone();
        let handle = characteristic.clone();
        self.runtime.spawn(async move {
            match native.read(&gatt).await {
                Ok(value) => {
                    callbacks.on_characteristic_value(&identity, &handle, Bytes::from(value), None)
                }
                Err(e) => callbacks.on_characteristic_value(
                    &identity,
                    &handle,
                    Bytes::new(),
                    Some(e.to_string()),
                ),
            }
        });
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
        let (native, gatt) = self.characteristic(&identity, characteristic)?;
        let callbacks = self.callbacks.clone();
        let handle = characteristic.clone();
        let data = data.to_vec();
        self.runtime.spawn(async move {
            let write_type = match mode {
                WriteMode::WithResponse => WriteType::WithResponse,
                WriteMode::WithoutResponse => WriteType::WithoutResponse,
            };
            let error = native
                .write(&gatt, &data, write_type)
                .await
                .err()
                .map(|e| e.to_string());
            match mode {
                WriteMode::WithResponse => {
                    callbacks.on_characteristic_written(&identity, &handle, error)
                }
                WriteMode::WithoutResponse => {
                    if let Some(error) = error {
                        warn!(device = %identity, uuid = %handle.uuid, %error, "write without response failed");
                    }
                }
            }
        });
        Ok(())
    }

    fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        let adapter = self.adapter()?.clone();
        let services = filter
            .service_uuids
            .iter()
            .map(|raw| {
                let normalized = normalize_uuid(raw)?;
                Uuid::parse_str(&normalized).map_err(|_| BridgeError::InvalidUuid(raw.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        self.runtime.spawn(async move {
            if let Err(e) = adapter.start_scan(GattScanFilter { services }).await {
                warn!(error = %e, "failed to start scan");
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        let adapter = self.adapter()?.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!(error = %e, "failed to stop scan");
            }
        });
        Ok(())
    }
}
