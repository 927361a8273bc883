//! Integration tests for the BLE bridge
//!
//! These tests drive the public call surface end to end:
//! - Scanning, filtering and session creation
//! - Connect, service discovery, read, write and disconnect outcomes
//! - Callback demultiplexing across sessions
//! - Fault handling at the operation boundary
//! - A radio that reports synchronously from inside the native call

use bytes::Bytes;
use gatt_bridge::test_utils::{RadioCall, RadioOp, Response, SimulatedPeripheral, TestFixture};
use gatt_bridge::{
    BridgeConfig, BridgeConfigBuilder, BridgeContext, BridgeError, CallbackAdapter,
    Characteristic, CharacteristicMap, ConnectResult, DisconnectResult, NativeRadio,
    PeripheralHandle, PowerState, ReadOptions, ReadStatus, ScanOptions, ScanStatus, Scanner,
    ServiceDiscoveryResult, SessionState, WriteMode, WriteOptions, WriteResult,
};
use gatt_bridge::radio::{
    Advertisement, CharacteristicHandle, ConnectionOptions, ScanFilter, ServiceHandle,
};
use std::sync::Arc;
use std::time::Duration;

fn sensor(id: &str) -> SimulatedPeripheral {
    SimulatedPeripheral::new(id, Some("Thermo Sensor"))
        .with_service("180F", &["2A19"])
        .with_service("180A", &["2A29", "2A24"])
        .with_value("2A19", &[64])
        .with_value("2A29", b"Acme")
        .with_value("2A24", b"TS-100")
}

// ============================================================================
// Mock Infrastructure: a radio that answers from inside the native call
// ============================================================================

/// Radio whose callbacks fire synchronously, before the native call returns
struct InlineRadio {
    adapter: Arc<CallbackAdapter>,
}

impl InlineRadio {
    const DEVICE: &'static str = "inline-1";

    fn new(adapter: Arc<CallbackAdapter>) -> Self {
        Self { adapter }
    }

    fn service() -> ServiceHandle {
        ServiceHandle {
            id: 1,
            uuid: "180F".to_string(),
        }
    }

    fn battery() -> CharacteristicHandle {
        CharacteristicHandle {
            id: 2,
            uuid: "00002a19-0000-1000-8000-00805f9b34fb".to_string(),
        }
    }
}

impl NativeRadio for InlineRadio {
    fn initialize(&self) -> gatt_bridge::Result<()> {
        self.adapter.on_state_updated(PowerState::PoweredOn);
        Ok(())
    }

    fn power_state(&self) -> PowerState {
        self.adapter.power_state()
    }

    fn connect(&self, peripheral: &PeripheralHandle, _: &ConnectionOptions) -> gatt_bridge::Result<()> {
        self.adapter.on_connected(
            &peripheral.identity,
            PeripheralHandle::new(peripheral.identity.clone(), 77),
        );
        Ok(())
    }

    fn cancel_connection(&self, peripheral: &PeripheralHandle) -> gatt_bridge::Result<()> {
        self.adapter.on_disconnected(&peripheral.identity, None);
        Ok(())
    }

    fn discover_services(&self, peripheral: &PeripheralHandle) -> gatt_bridge::Result<()> {
        self.adapter.on_services_ready(&peripheral.identity, None);
        Ok(())
    }

    fn services(&self, _: &PeripheralHandle) -> gatt_bridge::Result<Vec<ServiceHandle>> {
        Ok(vec![Self::service()])
    }

    fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
    ) -> gatt_bridge::Result<()> {
        self.adapter
            .on_characteristics_ready(&peripheral.identity, service, None);
        Ok(())
    }

    fn characteristics(
        &self,
        _: &PeripheralHandle,
        _: &ServiceHandle,
    ) -> gatt_bridge::Result<Vec<CharacteristicHandle>> {
        Ok(vec![Self::battery()])
    }

    fn read_value(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
    ) -> gatt_bridge::Result<()> {
        self.adapter.on_characteristic_value(
            &peripheral.identity,
            characteristic,
            Bytes::from_static(&[42]),
            None,
        );
        Ok(())
    }

    fn write_value(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
        _: &[u8],
        mode: WriteMode,
    ) -> gatt_bridge::Result<()> {
        if mode == WriteMode::WithResponse {
            self.adapter
                .on_characteristic_written(&peripheral.identity, characteristic, None);
        }
        Ok(())
    }

    fn start_scan(&self, _: &ScanFilter) -> gatt_bridge::Result<()> {
        self.adapter.on_discovered(
            Self::DEVICE.into(),
            Advertisement {
                local_name: Some("Inline".to_string()),
                ..Advertisement::default()
            },
        );
        Ok(())
    }

    fn stop_scan(&self) -> gatt_bridge::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Integration Tests: Scanning
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scan_without_matching_devices() {
    let config = BridgeConfigBuilder::new().name_filter("spirio").build();
    let fixture = TestFixture::with_config(config);
    fixture.radio.add_peripheral(sensor("a"));
    fixture
        .radio
        .add_peripheral(SimulatedPeripheral::new("b", None));

    let start = tokio::time::Instant::now();
    let result = fixture.scanner().scan(ScanOptions::seconds(5)).await;
    assert_eq!(result.status, ScanStatus::NoDevicesFound);
    assert!(result.devices.is_empty());
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert!(!fixture.radio.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_scan_reports_advertisement_details() {
    let fixture = TestFixture::new();
    fixture.radio.add_peripheral(
        sensor("a")
            .with_rssi(-41)
            .with_manufacturer_data(&[0x59, 0x00, 0xAA]),
    );

    let result = fixture.scanner().scan(ScanOptions::seconds(1)).await;
    assert_eq!(result.status, ScanStatus::Success);
    let device = &result.devices[0];
    assert_eq!(device.name(), "Thermo Sensor");
    assert_eq!(device.rssi(), Some(-41));
    assert_eq!(&device.advertised_data()[..], &[0x59, 0x00, 0xAA]);
    assert_eq!(device.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_scan_unauthorized_radio() {
    let fixture = TestFixture::new();
    fixture.radio.set_power_state(PowerState::Unauthorized);
    let result = fixture.scanner().scan(ScanOptions::seconds(5)).await;
    assert_eq!(result.status, ScanStatus::RadioDisabled);
}

#[tokio::test(start_paused = true)]
async fn test_scan_start_fault() {
    let fixture = TestFixture::new();
    fixture.radio.fail_next(RadioOp::StartScan);
    let result = fixture.scanner().scan(ScanOptions::seconds(1)).await;
    assert_eq!(result.status, ScanStatus::Exception);
    assert!(fixture.radio.calls().contains(&RadioCall::StopScan));
}

// ============================================================================
// Integration Tests: Device Session Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_session_flow() {
    let fixture = TestFixture::new();
    fixture.radio.add_peripheral(sensor("a"));

    let scan = fixture.scanner().scan(ScanOptions::seconds(1)).await;
    let mut session = scan.devices.into_iter().next().unwrap();

    assert_eq!(session.connect().await, ConnectResult::Connected);
    assert_eq!(
        session.discover_services().await,
        ServiceDiscoveryResult::Success
    );

    let battery = session
        .read_characteristic(ReadOptions::new(Characteristic::BatteryLevel))
        .await;
    assert_eq!(battery.status, ReadStatus::Success);
    assert_eq!(&battery.data[..], &[64]);

    let maker = session
        .read_characteristic(ReadOptions::new(Characteristic::ManufacturerName))
        .await;
    assert_eq!(&maker.data[..], b"Acme");

    assert_eq!(session.disconnect().await, DisconnectResult::Disconnected);
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_callback() {
    let fixture = TestFixture::new();
    let mut session =
        fixture.session_for(sensor("a").connect_response(Response::Fail("peer removed pairing".into())));

    assert_eq!(session.connect().await, ConnectResult::Failure);
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!session.is_connecting());
}

#[tokio::test(start_paused = true)]
async fn test_discovery_skips_unknown_characteristics() {
    let fixture = TestFixture::new();
    let mut session = fixture.session_for(
        SimulatedPeripheral::new("a", Some("Mixed")).with_service(
            "180A",
            &["2A29", "F000AA01-0451-4000-B000-000000000000", "2A24"],
        ),
    );
    session.connect().await;

    assert_eq!(
        session.discover_services().await,
        ServiceDiscoveryResult::Success
    );
    assert_eq!(
        session.characteristics(),
        vec![Characteristic::ManufacturerName, Characteristic::ModelNumber]
    );
}

#[tokio::test(start_paused = true)]
async fn test_discovery_fault_leaves_mapping_empty() {
    let fixture = TestFixture::new();
    let mut session = fixture.session_for(sensor("a"));
    session.connect().await;
    fixture.radio.fail_next(RadioOp::Characteristics);

    assert_eq!(
        session.discover_services().await,
        ServiceDiscoveryResult::Exception
    );
    assert!(session.characteristics().is_empty());
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_read_native_error() {
    let fixture = TestFixture::new();
    let mut session = fixture
        .connected_session(sensor("a").read_response(Response::Fail("insufficient authentication".into())))
        .await;

    let result = session
        .read_characteristic(ReadOptions::new(Characteristic::BatteryLevel))
        .await;
    assert_eq!(result.status, ReadStatus::Failure);
    assert!(result.data.is_empty());
    assert!(!session.is_read_in_flight(Characteristic::BatteryLevel));
}

#[tokio::test(start_paused = true)]
async fn test_read_unmapped_characteristic() {
    let fixture = TestFixture::new();
    let mut session = fixture.session_for(sensor("a"));

    let result = session
        .read_characteristic(ReadOptions::new(Characteristic::BatteryLevel))
        .await;
    assert_eq!(result.status, ReadStatus::CharacteristicNotFound);
    assert_eq!(
        fixture
            .radio
            .count(|c| matches!(c, RadioCall::ReadValue { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_late_value_does_not_leak_into_next_read() {
    let fixture = TestFixture::new();
    let mut session = fixture.connected_session(sensor("a")).await;

    fixture.radio.set_latency(Duration::from_secs(2));
    let first = session
        .read_characteristic(
            ReadOptions::new(Characteristic::BatteryLevel).with_timeout(Duration::from_millis(500)),
        )
        .await;
    assert_eq!(first.status, ReadStatus::Timeout);

    fixture.radio.set_latency(Duration::from_millis(10));
    let second = session
        .read_characteristic(ReadOptions::new(Characteristic::ModelNumber))
        .await;
    assert_eq!(&second.data[..], b"TS-100");

    // let the stale battery value arrive; nobody is waiting for it
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!session.is_read_in_flight(Characteristic::BatteryLevel));
    assert!(!session.is_read_in_flight(Characteristic::ModelNumber));
}

#[tokio::test(start_paused = true)]
async fn test_notification_during_read_is_ignored() {
    let fixture = TestFixture::new();
    let mut session = fixture.connected_session(sensor("a")).await;
    fixture.radio.set_latency(Duration::from_millis(100));

    let radio = fixture.radio.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        radio.notify("a", "2A29", b"unsolicited");
    });

    let result = session
        .read_characteristic(ReadOptions::new(Characteristic::BatteryLevel))
        .await;
    assert_eq!(result.status, ReadStatus::Success);
    assert_eq!(&result.data[..], &[64]);
}

#[tokio::test(start_paused = true)]
async fn test_write_without_response() {
    let fixture = TestFixture::new();
    let mut session = fixture
        .connected_session(
            SimulatedPeripheral::new("uart", Some("UART Bridge"))
                .with_service(
                    "6E400001-B5A3-F393-E0A9-E50E24DCCA9E",
                    &["6E400002-B5A3-F393-E0A9-E50E24DCCA9E"],
                )
                .write_response(Response::Silent),
        )
        .await;

    let result = session
        .write_characteristic(WriteOptions::from_strings(
            Characteristic::UartRx,
            false,
            ["AT+", "RESET\r\n"],
        ))
        .await;
    assert_eq!(result, WriteResult::Success);

    let writes: Vec<_> = fixture
        .radio
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            RadioCall::WriteValue { data, mode, .. } => Some((data, mode)),
            _ => None,
        })
        .collect();
    assert_eq!(
        writes,
        vec![(Bytes::from_static(b"AT+RESET\r\n"), WriteMode::WithoutResponse)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_write_with_response_timeout() {
    let fixture = TestFixture::new();
    let mut session = fixture
        .connected_session(
            SimulatedPeripheral::new("uart", Some("UART Bridge"))
                .with_service(
                    "6E400001-B5A3-F393-E0A9-E50E24DCCA9E",
                    &["6E400002-B5A3-F393-E0A9-E50E24DCCA9E"],
                )
                .write_response(Response::Silent),
        )
        .await;

    let result = session
        .write_characteristic(
            WriteOptions::new(Characteristic::UartRx, true, vec![0x01, 0x02])
                .with_timeout(Duration::from_secs(1)),
        )
        .await;
    assert_eq!(result, WriteResult::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_timeout() {
    let config = BridgeConfigBuilder::new()
        .disconnect_timeout(Duration::from_secs(2))
        .build();
    let fixture = TestFixture::with_config(config);
    let mut session = fixture
        .connected_session(sensor("a").disconnect_response(Response::Silent))
        .await;

    assert_eq!(session.disconnect().await, DisconnectResult::Timeout);
    assert!(session.is_connected());
}

// ============================================================================
// Integration Tests: Callback Demultiplexing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_sessions_receive_own_values() {
    let fixture = TestFixture::new();
    let mut first = fixture
        .connected_session(sensor("a").with_value("2A19", &[10]))
        .await;
    let mut second = fixture
        .connected_session(sensor("b").with_value("2A19", &[90]))
        .await;
    assert_eq!(fixture.context.adapter().session_count(), 2);

    let (a, b) = tokio::join!(
        first.read_characteristic(ReadOptions::new(Characteristic::BatteryLevel)),
        second.read_characteristic(ReadOptions::new(Characteristic::BatteryLevel)),
    );
    assert_eq!(&a.data[..], &[10]);
    assert_eq!(&b.data[..], &[90]);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_only_affects_its_session() {
    let fixture = TestFixture::new();
    let first = fixture.connected_session(sensor("a")).await;
    let second = fixture.connected_session(sensor("b")).await;

    fixture.radio.drop_link("a", "connection timeout");
    assert_eq!(first.state(), SessionState::Disconnected);
    assert_eq!(second.state(), SessionState::ServicesDiscovered);
}

#[tokio::test(start_paused = true)]
async fn test_rescan_keeps_connected_session_routed() {
    let fixture = TestFixture::new();
    fixture.radio.add_peripheral(sensor("a"));

    let scan = fixture.scanner().scan(ScanOptions::seconds(1)).await;
    let mut session = scan.devices.into_iter().next().unwrap();
    assert_eq!(session.connect().await, ConnectResult::Connected);
    assert_eq!(session.discover_services().await, ServiceDiscoveryResult::Success);
    let battery = ReadOptions::new(Characteristic::BatteryLevel);
    assert_eq!(session.read_characteristic(battery).await.status, ReadStatus::Success);

    let rescan = fixture.scanner().scan(ScanOptions::seconds(1)).await;
    assert_eq!(rescan.status, ScanStatus::Success);
    assert_eq!(rescan.devices.len(), 1);
    // the new session sees the live link but has not mapped anything yet
    assert!(rescan.devices[0].is_connected());
    assert!(rescan.devices[0].characteristics().is_empty());

    let read = session.read_characteristic(battery).await;
    assert_eq!(read.status, ReadStatus::Success);
    assert_eq!(&read.data[..], &[64]);

    drop(rescan);
    let read = session.read_characteristic(battery).await;
    assert_eq!(read.status, ReadStatus::Success);

    let disconnected = tokio::time::timeout(Duration::from_secs(60), session.disconnect()).await;
    assert_eq!(disconnected.unwrap(), DisconnectResult::Disconnected);
    assert_eq!(fixture.context.adapter().session_count(), 1);
    drop(session);
    assert_eq!(fixture.context.adapter().session_count(), 0);
}

#[tokio::test]
async fn test_inline_callbacks_are_not_lost() {
    let config = BridgeConfigBuilder::new()
        .init_settle_delay(Duration::ZERO)
        .build();
    let context = BridgeContext::new(config, InlineRadio::new).unwrap();

    let scan = Scanner::new(context.clone())
        .scan(ScanOptions {
            duration: Duration::from_millis(10),
            service_uuids: Vec::new(),
        })
        .await;
    assert_eq!(scan.status, ScanStatus::Success);
    let mut session = scan.devices.into_iter().next().unwrap();
    assert_eq!(session.identity().as_str(), InlineRadio::DEVICE);

    assert_eq!(session.connect().await, ConnectResult::Connected);
    assert_eq!(session.peripheral().instance, 77);
    assert_eq!(
        session.discover_services().await,
        ServiceDiscoveryResult::Success
    );

    let value = session
        .read_characteristic(ReadOptions::new(Characteristic::BatteryLevel))
        .await;
    assert_eq!(&value.data[..], &[42]);

    let ack = session
        .write_characteristic(WriteOptions::new(Characteristic::BatteryLevel, true, vec![1u8]))
        .await;
    assert_eq!(ack, WriteResult::Success);
    assert_eq!(session.disconnect().await, DisconnectResult::Disconnected);
}

// ============================================================================
// Integration Tests: Identity Map, Config & Errors
// ============================================================================

#[test]
fn test_identity_map_round_trip() {
    let map = CharacteristicMap::new();
    for characteristic in Characteristic::ALL {
        assert_eq!(map.resolve(map.uuid_of(characteristic)), Some(characteristic));
    }
    assert_eq!(map.resolve("0000FFE1-0000-1000-8000-00805F9B34FB"), None);
}

#[tokio::test(start_paused = true)]
async fn test_context_from_json_file() {
    let path = std::env::temp_dir().join(format!("gatt-bridge-{}.json", std::process::id()));
    std::fs::write(
        &path,
        r#"{ "discovery": { "name_filter": "thermo" }, "timing": { "init_settle_delay": "50ms" } }"#,
    )
    .unwrap();
    let config = BridgeConfig::from_json_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let fixture = TestFixture::with_config(config);
    fixture.radio.add_peripheral(sensor("a"));
    fixture
        .radio
        .add_peripheral(SimulatedPeripheral::new("b", Some("Beacon")));
    let result = fixture.scanner().scan(ScanOptions::seconds(1)).await;
    assert_eq!(result.devices.len(), 1);
}

#[test]
fn test_missing_config_file_is_io_error() {
    let err = BridgeConfig::from_json_file("/nonexistent/gatt-bridge.json").unwrap_err();
    assert!(matches!(err, BridgeError::Io(_)));
}

#[test]
fn test_error_is_retriable() {
    assert!(BridgeError::Native("adapter busy".into()).is_retriable());
    assert!(!BridgeError::InvalidConfig("bad".into()).is_retriable());
}
