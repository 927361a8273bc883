//! Process-wide bridge state
//!
//! A [`BridgeContext`] ties together the native radio, the callback adapter
//! it reports into, the characteristic identity map and the configuration.
//! Scanners and device sessions share one context through an `Arc`.

use std::fmt;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::adapter::CallbackAdapter;
use crate::characteristic::CharacteristicMap;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::radio::{NativeRadio, PowerState};

/// Shared radio, callback adapter, identity map and configuration
pub struct BridgeContext {
    radio: Arc<dyn NativeRadio>,
    adapter: Arc<CallbackAdapter>,
    characteristics: CharacteristicMap,
    config: BridgeConfig,
    initialized: OnceCell<()>,
}

impl BridgeContext {
    /// Create a context whose radio is built around the new callback adapter
    ///
    /// ```rust,ignore
    /// let context = BridgeContext::new(config, SimulatedRadio::new)?;
    /// ```
    pub fn new<R, F>(config: BridgeConfig, make_radio: F) -> Result<Arc<Self>>
    where
        R: NativeRadio + 'static,
        F: FnOnce(Arc<CallbackAdapter>) -> R,
    {
        config.validate()?;
        let adapter = Arc::new(CallbackAdapter::from_config(&config.discovery));
        let radio: Arc<dyn NativeRadio> = Arc::new(make_radio(adapter.clone()));
        Self::from_parts(config, adapter, radio)
    }

    /// Create a context from an already constructed radio and adapter
    ///
    /// The radio must deliver its callbacks to `adapter`.
    pub fn from_parts(
        config: BridgeConfig,
        adapter: Arc<CallbackAdapter>,
        radio: Arc<dyn NativeRadio>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let characteristics = CharacteristicMap::new();
        debug!(known = characteristics.len(), "characteristic map built");
        Ok(Arc::new(Self {
            radio,
            adapter,
            characteristics,
            config,
            initialized: OnceCell::new(),
        }))
    }

    /// Initialize the radio once, then wait out the settle delay
    ///
    /// Later calls return immediately. A failed initialization is retried on
    /// the next call.
    pub async fn ensure_initialized(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                info!("initializing radio");
                self.radio.initialize()?;
                tokio::time::sleep(self.config.timing.init_settle_delay).await;
                debug!(state = %self.radio.power_state(), "radio settled");
                Ok::<(), BridgeError>(())
            })
            .await?;
        Ok(())
    }

    /// Whether the radio has been initialized
    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Current radio power state
    pub fn power_state(&self) -> PowerState {
        self.radio.power_state()
    }

    /// Native radio
    pub fn radio(&self) -> &dyn NativeRadio {
        self.radio.as_ref()
    }

    /// Callback adapter the radio reports into
    pub fn adapter(&self) -> &Arc<CallbackAdapter> {
        &self.adapter
    }

    /// Characteristic identity map
    pub fn characteristic_map(&self) -> &CharacteristicMap {
        &self.characteristics
    }

    /// Bridge configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

impl fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeContext")
            .field("initialized", &self.is_initialized())
            .field("power_state", &self.power_state())
            .field("sessions", &self.adapter.session_count())
            .finish()
    }
}
