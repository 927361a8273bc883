//! Time-boxed discovery producing device sessions

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::context::BridgeContext;
use crate::error::Result;
use crate::models::{ScanOptions, ScanStatus};
use crate::radio::{PowerState, ScanFilter};
use crate::session::{guarded, DeviceSession};

/// Result of [`Scanner::scan`]
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Outcome tag
    pub status: ScanStatus,
    /// Sessions for accepted devices, in discovery order
    pub devices: Vec<DeviceSession>,
}

impl ScanResult {
    fn empty(status: ScanStatus) -> Self {
        Self {
            status,
            devices: Vec::new(),
        }
    }
}

/// Runs scan windows against a bridge context
#[derive(Debug, Clone)]
pub struct Scanner {
    context: Arc<BridgeContext>,
}

impl Scanner {
    /// Create a scanner
    pub fn new(context: Arc<BridgeContext>) -> Self {
        Self { context }
    }

    /// Context this scanner runs against
    pub fn context(&self) -> &Arc<BridgeContext> {
        &self.context
    }

    /// Listen for advertisements for `options.duration`
    ///
    /// Devices from earlier scans are forgotten when the window opens.
    pub async fn scan(&self, options: ScanOptions) -> ScanResult {
        match guarded("scan", self.try_scan(&options)).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "scan faulted");
                if let Err(e) = self.context.radio().stop_scan() {
                    debug!(error = %e, "stop_scan after fault also failed");
                }
                ScanResult::empty(ScanStatus::Exception)
            }
        }
    }

    async fn try_scan(&self, options: &ScanOptions) -> Result<ScanResult> {
        self.context.ensure_initialized().await?;

        let power = self.context.power_state();
        if power != PowerState::PoweredOn {
            warn!(state = %power, "radio not usable, not scanning");
            return Ok(ScanResult::empty(ScanStatus::RadioDisabled));
        }

        let adapter = self.context.adapter();
        adapter.clear_discovered();

        let filter = ScanFilter {
            service_uuids: options.service_uuids.clone(),
        };
        info!(
            duration = %humantime::format_duration(options.duration),
            services = filter.service_uuids.len(),
            "scanning"
        );
        self.context.radio().start_scan(&filter)?;
        tokio::time::sleep(options.duration).await;
        self.context.radio().stop_scan()?;

        let devices: Vec<DeviceSession> = adapter
            .discovered()
            .into_iter()
            .map(|device| DeviceSession::new(self.context.clone(), device))
            .collect();

        if devices.is_empty() {
            info!("scan finished, no devices found");
            return Ok(ScanResult::empty(ScanStatus::NoDevicesFound));
        }

        info!(count = devices.len(), "scan finished");
        Ok(ScanResult {
            status: ScanStatus::Success,
            devices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfigBuilder;
    use crate::test_utils::{RadioCall, RadioOp, SimulatedPeripheral, TestFixture};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_scan_collects_devices_in_order() {
        let fixture = TestFixture::new();
        fixture.radio.add_peripheral(SimulatedPeripheral::new("a", Some("Alpha")));
        fixture.radio.add_peripheral(SimulatedPeripheral::new("b", None));

        let result = fixture.scanner().scan(ScanOptions::seconds(1)).await;
        assert_eq!(result.status, ScanStatus::Success);
        let ids: Vec<_> = result.devices.iter().map(|d| d.identity().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(fixture.radio.count(|c| matches!(c, RadioCall::StopScan)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_applies_name_filter() {
        let config = BridgeConfigBuilder::new().name_filter("alpha").build();
        let fixture = TestFixture::with_config(config);
        fixture.radio.add_peripheral(SimulatedPeripheral::new("a", Some("ALPHA-7")));
        fixture.radio.add_peripheral(SimulatedPeripheral::new("b", Some("Beta")));
        fixture.radio.add_peripheral(SimulatedPeripheral::new("c", None));

        let result = fixture.scanner().scan(ScanOptions::seconds(1)).await;
        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.devices[0].name(), "ALPHA-7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_with_radio_off() {
        let fixture = TestFixture::new();
        fixture.radio.set_power_state(PowerState::PoweredOff);
        fixture.radio.add_peripheral(SimulatedPeripheral::new("a", Some("Alpha")));

        let result = fixture.scanner().scan(ScanOptions::seconds(1)).await;
        assert_eq!(result.status, ScanStatus::RadioDisabled);
        assert_eq!(fixture.radio.count(|c| matches!(c, RadioCall::StartScan(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_fault_stops_scanning() {
        let fixture = TestFixture::new();
        fixture.radio.fail_next(RadioOp::StopScan);

        let result = fixture.scanner().scan(ScanOptions::seconds(1)).await;
        assert_eq!(result.status, ScanStatus::Exception);
        assert!(result.devices.is_empty());
        // the failed stop plus the cleanup stop
        assert_eq!(fixture.radio.count(|c| matches!(c, RadioCall::StopScan)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_scan_forgets_previous_devices() {
        let fixture = TestFixture::new();
        fixture.radio.add_peripheral(SimulatedPeripheral::new("a", Some("Alpha")));
        let first = fixture.scanner().scan(ScanOptions::seconds(1)).await;
        assert_eq!(first.devices.len(), 1);

        fixture.radio.remove_peripheral("a");
        let second = fixture.scanner().scan(ScanOptions::seconds(1)).await;
        assert_eq!(second.status, ScanStatus::NoDevicesFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_passes_service_filter() {
        let fixture = TestFixture::new();
        fixture.radio.add_peripheral(
            SimulatedPeripheral::new("a", Some("Alpha")).advertising_service("180F"),
        );
        fixture.radio.add_peripheral(SimulatedPeripheral::new("b", Some("Beta")));

        let options = ScanOptions {
            duration: Duration::from_secs(1),
            service_uuids: vec!["180F".to_string()],
        };
        let result = fixture.scanner().scan(options).await;
        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.devices[0].identity().as_str(), "a");
    }
}
