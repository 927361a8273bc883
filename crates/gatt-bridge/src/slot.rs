//! Completion slots: single-shot handoff from native callbacks to callers
//!
//! A [`CompletionSlot`] is armed by the caller right before it issues a native
//! call and resolved by the callback adapter when the native stack reports
//! the outcome. Each arm yields a [`SlotHandle`] that delivers the value at
//! most once.
//!
//! ```text
//!  caller task                       callback context
//!  ───────────                       ────────────────
//!  handle = slot.arm()
//!  radio.read_value(..)  ───────►    native stack works
//!  handle.wait_timeout(5s)           slot.resolve(value)
//!        ◄──────────────────────────────────┘
//! ```
//!
//! # Re-arming
//!
//! `arm()` replaces whatever was armed before. A waiter on the replaced slot
//! is orphaned and its `wait()` never completes; only a timeout gets it out.
//! Use [`CompletionSlot::try_arm`] to get [`BridgeError::SlotBusy`] instead.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::adapter::{
    ConnectOutcome, DisconnectOutcome, DiscoveryOutcome, ReadOutcome, WriteOutcome,
};
use crate::error::{BridgeError, Result};

/// Operation kinds that own a completion slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Connect to a peripheral
    Connect,
    /// Disconnect from a peripheral
    Disconnect,
    /// Discover the peripheral's services
    ServiceDiscovery,
    /// Discover the characteristics of one service
    CharacteristicDiscovery,
    /// Read a characteristic value
    Read,
    /// Write a characteristic value with response
    Write,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Connect => write!(f, "connect"),
            OperationKind::Disconnect => write!(f, "disconnect"),
            OperationKind::ServiceDiscovery => write!(f, "service-discovery"),
            OperationKind::CharacteristicDiscovery => write!(f, "characteristic-discovery"),
            OperationKind::Read => write!(f, "read"),
            OperationKind::Write => write!(f, "write"),
        }
    }
}

/// Single-assignment, replaceable result slot for one operation kind
pub struct CompletionSlot<T> {
    kind: OperationKind,
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> CompletionSlot<T> {
    /// Create an unarmed slot
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            sender: Mutex::new(None),
        }
    }

    /// Operation kind this slot serves
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Arm a fresh slot, replacing (and orphaning) any outstanding one
    pub fn arm(&self) -> SlotHandle<T> {
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.sender.lock().replace(tx) {
            if !previous.is_closed() {
                debug!(kind = %self.kind, "re-armed slot, abandoning pending waiter");
            }
        }
        SlotHandle {
            kind: self.kind,
            receiver: rx,
        }
    }

    /// Arm a fresh slot only if no live waiter is outstanding
    pub fn try_arm(&self) -> Result<SlotHandle<T>> {
        let mut sender = self.sender.lock();
        if sender.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(BridgeError::SlotBusy(self.kind));
        }
        let (tx, rx) = oneshot::channel();
        *sender = Some(tx);
        Ok(SlotHandle {
            kind: self.kind,
            receiver: rx,
        })
    }

    /// Resolve the armed slot
    ///
    /// Returns `true` if a waiter received the value. With nothing armed, or
    /// a waiter that already gave up, this is a no-op returning `false`.
    pub fn resolve(&self, value: T) -> bool {
        let Some(tx) = self.sender.lock().take() else {
            trace!(kind = %self.kind, "resolve with no armed slot, ignoring");
            return false;
        };
        match tx.send(value) {
            Ok(()) => true,
            Err(_) => {
                trace!(kind = %self.kind, "resolve after waiter gave up, ignoring");
                false
            }
        }
    }

    /// Whether a slot is armed with a waiter still listening
    pub fn is_armed(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Drop the armed slot without resolving it
    pub fn disarm(&self) {
        self.sender.lock().take();
    }
}

impl<T> fmt::Debug for CompletionSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSlot")
            .field("kind", &self.kind)
            .field("armed", &self.is_armed())
            .finish()
    }
}

/// Awaitable side of an armed slot
#[derive(Debug)]
pub struct SlotHandle<T> {
    kind: OperationKind,
    receiver: oneshot::Receiver<T>,
}

impl<T> SlotHandle<T> {
    /// Operation kind this handle waits on
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Wait until the slot is resolved
    ///
    /// If the slot is re-armed before resolution this never completes.
    pub async fn wait(self) -> T {
        match self.receiver.await {
            Ok(value) => value,
            Err(_) => {
                debug!(kind = %self.kind, "waiter orphaned by re-arm");
                futures::future::pending().await
            }
        }
    }

    /// Wait with a budget; `None` means the operation is still unresolved
    ///
    /// The native call is not cancelled. A late resolve lands on a closed
    /// channel and is dropped.
    pub async fn wait_timeout(self, budget: Duration) -> Option<T> {
        let kind = self.kind;
        match tokio::time::timeout(budget, self.wait()).await {
            Ok(value) => Some(value),
            Err(_) => {
                debug!(kind = %kind, budget_ms = budget.as_millis() as u64, "slot wait timed out");
                None
            }
        }
    }

    /// Wait with an optional budget; `None` budget waits indefinitely
    pub async fn wait_for(self, budget: Option<Duration>) -> Option<T> {
        match budget {
            Some(budget) => self.wait_timeout(budget).await,
            None => Some(self.wait().await),
        }
    }
}

/// One completion slot per operation kind for a single device session
#[derive(Debug)]
pub struct SlotRegistry {
    /// Connect outcome
    pub connect: CompletionSlot<ConnectOutcome>,
    /// Disconnect outcome
    pub disconnect: CompletionSlot<DisconnectOutcome>,
    /// Service discovery outcome
    pub service_discovery: CompletionSlot<DiscoveryOutcome>,
    /// Per-service characteristic discovery outcome
    pub characteristic_discovery: CompletionSlot<DiscoveryOutcome>,
    /// Read outcome
    pub read: CompletionSlot<ReadOutcome>,
    /// Write-with-response outcome
    pub write: CompletionSlot<WriteOutcome>,
}

impl SlotRegistry {
    /// Create a registry with every slot unarmed
    pub fn new() -> Self {
        Self {
            connect: CompletionSlot::new(OperationKind::Connect),
            disconnect: CompletionSlot::new(OperationKind::Disconnect),
            service_discovery: CompletionSlot::new(OperationKind::ServiceDiscovery),
            characteristic_discovery: CompletionSlot::new(OperationKind::CharacteristicDiscovery),
            read: CompletionSlot::new(OperationKind::Read),
            write: CompletionSlot::new(OperationKind::Write),
        }
    }

    /// Whether the slot for `kind` has a live waiter
    pub fn is_armed(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Connect => self.connect.is_armed(),
            OperationKind::Disconnect => self.disconnect.is_armed(),
            OperationKind::ServiceDiscovery => self.service_discovery.is_armed(),
            OperationKind::CharacteristicDiscovery => self.characteristic_discovery.is_armed(),
            OperationKind::Read => self.read.is_armed(),
            OperationKind::Write => self.write.is_armed(),
        }
    }

    /// Kinds with a live waiter, for diagnostics
    pub fn armed_kinds(&self) -> Vec<OperationKind> {
        [
            OperationKind::Connect,
            OperationKind::Disconnect,
            OperationKind::ServiceDiscovery,
            OperationKind::CharacteristicDiscovery,
            OperationKind::Read,
            OperationKind::Write,
        ]
        .into_iter()
        .filter(|kind| self.is_armed(*kind))
        .collect()
    }
}

impl Default for SlotRegistry {
    fn default() -> Self {
        Self::new()
    }
}
