//! Native callback adapter
//!
//! The [`CallbackAdapter`] is the only object the native stack calls into.
//! It demultiplexes each callback either to the device session registered
//! under the callback's [`DeviceIdentity`] or, for advertisements, to the
//! discovery feed read by the scanner.
//!
//! ```text
//!                 ┌─────────────────────────────┐
//!  native stack ─►│       CallbackAdapter       │
//!                 ├─────────────────────────────┤
//!                 │ on_discovered ──► discovery │──► Scanner
//!                 │                    feed     │
//!                 │ on_connected   ─┐           │
//!                 │ on_services_…   ├─► session │──► DeviceSession
//!                 │ on_char_value  ─┘   links   │    (SlotRegistry)
//!                 └─────────────────────────────┘
//! ```
//!
//! Callbacks may run on any thread. Everything they touch is behind
//! `parking_lot` locks and the completion slots' oneshot channels.
//! A callback for a device nobody holds a session for is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::config::DiscoveryConfig;
use crate::radio::{
    Advertisement, CharacteristicHandle, DeviceIdentity, PeripheralHandle, PowerState,
    ServiceHandle,
};
use crate::session::SessionState;
use crate::slot::SlotRegistry;

/// Outcome of a native connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Link established; the stack's peripheral handle for the link
    Connected(PeripheralHandle),
    /// Native error description
    Failed(String),
}

/// Outcome of a native disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Link torn down cleanly
    Disconnected,
    /// Native error description
    Failed(String),
}

/// Outcome of service or characteristic discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Discovery finished
    Ready,
    /// Native error description
    Failed(String),
}

/// Outcome of a native read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Raw characteristic value
    Value(Bytes),
    /// Native error description
    Failed(String),
}

/// Outcome of a native write with response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Peripheral acknowledged the write
    Acknowledged,
    /// Native error description
    Failed(String),
}

/// Device reported by the native stack during a scan
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// Native identity
    pub identity: DeviceIdentity,
    /// Advertisement that announced it
    pub advertisement: Advertisement,
    /// When the advertisement was accepted
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveredDevice {
    /// Advertised local name, empty if none
    pub fn name(&self) -> &str {
        self.advertisement.local_name.as_deref().unwrap_or_default()
    }
}

/// Shared state between device sessions and the adapter
///
/// Sessions own the `Arc`; the adapter only keeps a `Weak`. Sessions created
/// for the same identity while a link is alive share it.
#[derive(Debug)]
pub(crate) struct SessionLink {
    pub(crate) identity: DeviceIdentity,
    pub(crate) slots: SlotRegistry,
    /// Native peripheral handle for the current link
    pub(crate) peripheral: Mutex<PeripheralHandle>,
    /// Native characteristic handle ids with a read outstanding
    pub(crate) reads_in_flight: Mutex<HashSet<u64>>,
    /// Service whose characteristic discovery is being awaited
    pub(crate) awaited_service: Mutex<Option<u64>>,
    pub(crate) state: Mutex<SessionState>,
}

impl SessionLink {
    pub(crate) fn new(identity: DeviceIdentity) -> Self {
        Self {
            peripheral: Mutex::new(PeripheralHandle::new(identity.clone(), 0)),
            identity,
            slots: SlotRegistry::new(),
            reads_in_flight: Mutex::new(HashSet::new()),
            awaited_service: Mutex::new(None),
            state: Mutex::new(SessionState::Idle),
        }
    }
}

/// Accumulated advertisements for the current scan window
#[derive(Debug, Default)]
struct DiscoveryFeed {
    devices: Vec<DiscoveredDevice>,
    seen: HashSet<DeviceIdentity>,
}

/// Receiver of every native callback
#[derive(Debug)]
pub struct CallbackAdapter {
    /// Lower-cased name substring an advertisement must contain
    name_filter: Option<String>,
    sessions: RwLock<HashMap<DeviceIdentity, Weak<SessionLink>>>,
    discovered: Mutex<DiscoveryFeed>,
    power_state: Mutex<PowerState>,
}

impl CallbackAdapter {
    /// Create an adapter with the given discovery policy
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            name_filter: config
                .name_filter
                .as_deref()
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_lowercase),
            sessions: RwLock::new(HashMap::new()),
            discovered: Mutex::new(DiscoveryFeed::default()),
            power_state: Mutex::new(PowerState::Unknown),
        }
    }

    /// Create an adapter that accepts every advertisement
    pub fn new() -> Self {
        Self::from_config(&DiscoveryConfig::default())
    }

    // ===== Session registry =====

    /// Link for `identity`, reusing the live one if another session holds it
    pub(crate) fn attach(&self, identity: DeviceIdentity) -> Arc<SessionLink> {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&identity).and_then(Weak::upgrade) {
            debug!(device = %identity, state = %*existing.state.lock(), "sharing live session link");
            return existing;
        }
        let link = Arc::new(SessionLink::new(identity.clone()));
        sessions.insert(identity, Arc::downgrade(&link));
        link
    }

    /// Drop the registration once `link` has no other holder
    ///
    /// Called by a session that still owns its `Arc`.
    pub(crate) fn detach(&self, link: &Arc<SessionLink>) {
        let mut sessions = self.sessions.write();
        let ours = sessions
            .get(&link.identity)
            .is_some_and(|registered| std::ptr::eq(registered.as_ptr(), Arc::as_ptr(link)));
        if ours && Arc::strong_count(link) <= 1 {
            sessions.remove(&link.identity);
        }
    }

    fn link(&self, identity: &DeviceIdentity) -> Option<Arc<SessionLink>> {
        let link = self.sessions.read().get(identity).and_then(Weak::upgrade);
        if link.is_none() {
            trace!(device = %identity, "callback for device without a session, ignoring");
        }
        link
    }

    /// Number of live sessions registered
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    // ===== Discovery feed =====

    /// Forget every device from the previous scan window
    pub fn clear_discovered(&self) {
        let mut feed = self.discovered.lock();
        feed.devices.clear();
        feed.seen.clear();
    }

    /// Snapshot of devices accepted so far, in discovery order
    pub fn discovered(&self) -> Vec<DiscoveredDevice> {
        self.discovered.lock().devices.clone()
    }

    /// Number of devices accepted so far
    pub fn discovered_count(&self) -> usize {
        self.discovered.lock().devices.len()
    }

    /// Last power state the stack reported
    pub fn power_state(&self) -> PowerState {
        *self.power_state.lock()
    }

    fn matches_filter(&self, name: Option<&str>) -> bool {
        match (&self.name_filter, name) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(filter), Some(name)) => name.to_lowercase().contains(filter.as_str()),
        }
    }

    // ===== Native callbacks =====

    /// Radio power state changed
    pub fn on_state_updated(&self, state: PowerState) {
        info!(%state, "radio state updated");
        *self.power_state.lock() = state;
    }

    /// Advertisement received while scanning
    pub fn on_discovered(&self, identity: DeviceIdentity, advertisement: Advertisement) {
        if !self.matches_filter(advertisement.local_name.as_deref()) {
            trace!(device = %identity, name = ?advertisement.local_name, "advertisement filtered out");
            return;
        }

        let mut feed = self.discovered.lock();
        if !feed.seen.insert(identity.clone()) {
            return;
        }

        info!(
            device = %identity,
            name = ?advertisement.local_name,
            rssi = ?advertisement.rssi,
            "found device"
        );
        feed.devices.push(DiscoveredDevice {
            identity,
            advertisement,
            discovered_at: Utc::now(),
        });
    }

    /// Native connect succeeded
    pub fn on_connected(&self, identity: &DeviceIdentity, peripheral: PeripheralHandle) {
        if let Some(link) = self.link(identity) {
            debug!(device = %identity, instance = peripheral.instance, "connected");
            link.slots.connect.resolve(ConnectOutcome::Connected(peripheral));
        }
    }

    /// Native connect failed
    pub fn on_connect_failed(&self, identity: &DeviceIdentity, error: impl Into<String>) {
        let error = error.into();
        if let Some(link) = self.link(identity) {
            warn!(device = %identity, %error, "failed to connect");
            link.slots.connect.resolve(ConnectOutcome::Failed(error));
        }
    }

    /// Link torn down, on request or not
    pub fn on_disconnected(&self, identity: &DeviceIdentity, error: Option<String>) {
        let Some(link) = self.link(identity) else {
            return;
        };

        let outcome = match error {
            Some(error) => {
                warn!(device = %identity, %error, "disconnect reported an error");
                DisconnectOutcome::Failed(error)
            }
            None => {
                debug!(device = %identity, "disconnected");
                DisconnectOutcome::Disconnected
            }
        };

        if !link.slots.disconnect.resolve(outcome) {
            warn!(device = %identity, "link lost");
            *link.state.lock() = SessionState::Disconnected;
            link.reads_in_flight.lock().clear();
        }
    }

    /// Service discovery finished
    pub fn on_services_ready(&self, identity: &DeviceIdentity, error: Option<String>) {
        if let Some(link) = self.link(identity) {
            let outcome = match error {
                Some(error) => {
                    warn!(device = %identity, %error, "service discovery failed");
                    DiscoveryOutcome::Failed(error)
                }
                None => DiscoveryOutcome::Ready,
            };
            link.slots.service_discovery.resolve(outcome);
        }
    }

    /// Characteristic discovery for one service finished
    pub fn on_characteristics_ready(
        &self,
        identity: &DeviceIdentity,
        service: &ServiceHandle,
        error: Option<String>,
    ) {
        let Some(link) = self.link(identity) else {
            return;
        };
        if *link.awaited_service.lock() != Some(service.id) {
            debug!(device = %identity, service = %service.uuid, "late characteristic discovery, ignoring");
            return;
        }

        let outcome = match error {
            Some(error) => {
                warn!(device = %identity, service = %service.uuid, %error, "characteristic discovery failed");
                DiscoveryOutcome::Failed(error)
            }
            None => DiscoveryOutcome::Ready,
        };
        link.slots.characteristic_discovery.resolve(outcome);
    }

    /// Characteristic value arrived, either for a read or as a notification
    pub fn on_characteristic_value(
        &self,
        identity: &DeviceIdentity,
        characteristic: &CharacteristicHandle,
        value: Bytes,
        error: Option<String>,
    ) {
        let Some(link) = self.link(identity) else {
            return;
        };

        if let Some(error) = error {
            warn!(device = %identity, uuid = %characteristic.uuid, %error, "read failed");
            link.reads_in_flight.lock().remove(&characteristic.id);
            link.slots.read.resolve(ReadOutcome::Failed(error));
            return;
        }

        let was_read = link.reads_in_flight.lock().remove(&characteristic.id);
        if was_read {
            trace!(device = %identity, uuid = %characteristic.uuid, len = value.len(), "read value");
            link.slots.read.resolve(ReadOutcome::Value(value));
        } else {
            // notifications are not subscribed to; nothing consumes them
            trace!(device = %identity, uuid = %characteristic.uuid, "unsolicited value dropped");
        }
    }

    /// Write with response acknowledged or rejected
    pub fn on_characteristic_written(
        &self,
        identity: &DeviceIdentity,
        characteristic: &CharacteristicHandle,
        error: Option<String>,
    ) {
        if let Some(link) = self.link(identity) {
            let outcome = match error {
                Some(error) => {
                    warn!(device = %identity, uuid = %characteristic.uuid, %error, "write failed");
                    WriteOutcome::Failed(error)
                }
                None => WriteOutcome::Acknowledged,
            };
            link.slots.write.resolve(outcome);
        }
    }
}

impl Default for CallbackAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert(name: Option<&str>) -> Advertisement {
        Advertisement {
            local_name: name.map(str::to_string),
            manufacturer_data: Bytes::from_static(&[0x4C, 0x00]),
            service_uuids: Vec::new(),
            rssi: Some(-60),
        }
    }

    fn filtered(filter: &str) -> CallbackAdapter {
        CallbackAdapter::from_config(&DiscoveryConfig {
            name_filter: Some(filter.to_string()),
        })
    }

    #[test]
    fn test_discovery_deduplicates_by_identity() {
        let adapter = CallbackAdapter::new();
        adapter.on_discovered("dev-1".into(), advert(Some("Thermo")));
        adapter.on_discovered("dev-1".into(), advert(Some("Thermo")));
        adapter.on_discovered("dev-2".into(), advert(None));

        let found = adapter.discovered();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].identity, DeviceIdentity::from("dev-1"));
        assert_eq!(found[0].name(), "Thermo");
        assert_eq!(found[1].name(), "");
    }

    #[test]
    fn test_name_filter_is_case_insensitive_substring() {
        let adapter = filtered("Spirio");
        adapter.on_discovered("a".into(), advert(Some("SPIRIO r")));
        adapter.on_discovered("b".into(), advert(Some("my spirio")));
        adapter.on_discovered("c".into(), advert(Some("Thermo")));
        adapter.on_discovered("d".into(), advert(None));
        assert_eq!(adapter.discovered_count(), 2);
    }

    #[test]
    fn test_blank_filter_accepts_everything() {
        let adapter = filtered("   ");
        adapter.on_discovered("d".into(), advert(None));
        assert_eq!(adapter.discovered_count(), 1);
    }

    #[test]
    fn test_clear_discovered_resets_dedup() {
        let adapter = CallbackAdapter::new();
        adapter.on_discovered("dev-1".into(), advert(Some("x")));
        adapter.clear_discovered();
        assert_eq!(adapter.discovered_count(), 0);
        adapter.on_discovered("dev-1".into(), advert(Some("x")));
        assert_eq!(adapter.discovered_count(), 1);
    }

    #[test]
    fn test_callbacks_for_unknown_device_are_ignored() {
        let adapter = CallbackAdapter::new();
        let id = DeviceIdentity::from("ghost");
        adapter.on_connected(&id, PeripheralHandle::new(id.clone(), 1));
        adapter.on_disconnected(&id, None);
        adapter.on_services_ready(&id, Some("boom".to_string()));
        assert_eq!(adapter.session_count(), 0);
    }

    #[tokio::test]
    async fn test_routes_connect_to_registered_session() {
        let adapter = CallbackAdapter::new();
        let id = DeviceIdentity::from("dev-1");
        let link = adapter.attach(id.clone());
        assert_eq!(adapter.session_count(), 1);

        let handle = link.slots.connect.arm();
        adapter.on_connected(&id, PeripheralHandle::new(id.clone(), 9));
        assert_eq!(
            handle.wait().await,
            ConnectOutcome::Connected(PeripheralHandle::new(id.clone(), 9))
        );

        adapter.detach(&link);
        assert_eq!(adapter.session_count(), 0);
    }

    #[tokio::test]
    async fn test_value_for_pending_read_resolves_slot() {
        let adapter = CallbackAdapter::new();
        let id = DeviceIdentity::from("dev-1");
        let link = adapter.attach(id.clone());
        let ch = CharacteristicHandle {
            id: 4,
            uuid: "2A19".to_string(),
        };

        // not pending: treated as a notification and dropped
        let handle = link.slots.read.arm();
        adapter.on_characteristic_value(&id, &ch, Bytes::from_static(&[1]), None);
        assert!(link.slots.read.is_armed());

        link.reads_in_flight.lock().insert(ch.id);
        adapter.on_characteristic_value(&id, &ch, Bytes::from_static(&[87]), None);
        assert_eq!(handle.wait().await, ReadOutcome::Value(Bytes::from_static(&[87])));
        assert!(link.reads_in_flight.lock().is_empty());
    }

    #[test]
    fn test_unsolicited_disconnect_marks_session() {
        let adapter = CallbackAdapter::new();
        let id = DeviceIdentity::from("dev-1");
        let link = adapter.attach(id.clone());
        *link.state.lock() = SessionState::Connected;

        adapter.on_disconnected(&id, Some("supervision timeout".to_string()));
        assert_eq!(*link.state.lock(), SessionState::Disconnected);
    }

    #[test]
    fn test_attach_shares_live_link() {
        let adapter = CallbackAdapter::new();
        let id = DeviceIdentity::from("dev-1");
        let first = adapter.attach(id.clone());
        *first.state.lock() = SessionState::Connected;

        let second = adapter.attach(id.clone());
        assert!(Arc::ptr_eq(&first, &second));

        // the second holder going away keeps the registration for the first
        adapter.detach(&second);
        drop(second);
        assert_eq!(adapter.session_count(), 1);
        adapter.on_disconnected(&id, None);
        assert_eq!(*first.state.lock(), SessionState::Disconnected);

        adapter.detach(&first);
        drop(first);
        assert_eq!(adapter.session_count(), 0);
        let fresh = adapter.attach(id);
        assert_eq!(*fresh.state.lock(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_characteristic_discovery_matches_awaited_service() {
        let adapter = CallbackAdapter::new();
        let id = DeviceIdentity::from("dev-1");
        let link = adapter.attach(id.clone());
        let battery = ServiceHandle {
            id: 1,
            uuid: "180F".to_string(),
        };
        let info = ServiceHandle {
            id: 2,
            uuid: "180A".to_string(),
        };

        *link.awaited_service.lock() = Some(info.id);
        let handle = link.slots.characteristic_discovery.arm();
        // a straggler for the previous service must not settle this one
        adapter.on_characteristics_ready(&id, &battery, Some("auth".to_string()));
        assert!(link.slots.characteristic_discovery.is_armed());

        adapter.on_characteristics_ready(&id, &info, None);
        assert_eq!(handle.wait().await, DiscoveryOutcome::Ready);
    }

    #[test]
    fn test_state_updates_are_recorded() {
        let adapter = CallbackAdapter::new();
        assert_eq!(adapter.power_state(), PowerState::Unknown);
        adapter.on_state_updated(PowerState::PoweredOn);
        assert_eq!(adapter.power_state(), PowerState::PoweredOn);
    }
}
