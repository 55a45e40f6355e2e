//! Simulated buses and transports
//!
//! A [`SimulatedBus`] maps addresses to device behaviors and opens
//! [`SimulatedLink`]s for them, journaling every operation so tests can
//! assert exactly which channels were touched. A [`SimulatedTransport`]
//! enumerates a subset of the bus the way a platform transport would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fix_detect::{
    numbered_port_names, CandidatePort, DetectError, DeviceKind, LinkOpener, SerialLink,
    TransportEnumerator,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::link::{IoEvent, Journal, SimBehavior, SimulatedLink};

/// Addresses with simulated devices behind them
#[derive(Debug, Default)]
pub struct SimulatedBus {
    devices: Mutex<HashMap<String, SimBehavior>>,
    journal: Journal,
}

impl SimulatedBus {
    /// Create an empty bus
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<String, SimBehavior>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a device at `address`, replacing whatever was there
    ///
    /// Channels already open keep their old behavior.
    pub fn attach(&self, address: impl Into<String>, behavior: SimBehavior) {
        self.devices().insert(address.into(), behavior);
    }

    /// Remove the device at `address`; later opens fail
    pub fn detach(&self, address: &str) {
        self.devices().remove(address);
    }

    /// Snapshot of every I/O operation so far
    pub fn journal(&self) -> Vec<IoEvent> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Operations on one address
    pub fn events_for(&self, address: &str) -> Vec<IoEvent> {
        self.journal()
            .into_iter()
            .filter(|e| e.address() == address)
            .collect()
    }

    /// Number of open attempts on `address`, successful or not
    pub fn open_count(&self, address: &str) -> usize {
        self.events_for(address)
            .iter()
            .filter(|e| matches!(e, IoEvent::Open { .. } | IoEvent::OpenFailed { .. }))
            .count()
    }

    /// Whether any I/O happened on `address`
    pub fn touched(&self, address: &str) -> bool {
        !self.events_for(address).is_empty()
    }

    /// Number of channels on `address` that are currently open
    pub fn open_links(&self, address: &str) -> usize {
        let events = self.events_for(address);
        let opened = events
            .iter()
            .filter(|e| matches!(e, IoEvent::Open { .. }))
            .count();
        let closed = events
            .iter()
            .filter(|e| matches!(e, IoEvent::Closed { .. }))
            .count();
        opened.saturating_sub(closed)
    }

    fn record(&self, event: IoEvent) {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Forget all recorded operations
    pub fn clear_journal(&self) {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl LinkOpener for SimulatedBus {
    fn open(&self, address: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, DetectError> {
        let behavior = self.devices().get(address).cloned();
        let result = match behavior {
            None => Err(DetectError::TransportUnavailable {
                device: address.to_string(),
                reason: "no such port".to_string(),
            }),
            Some(SimBehavior::OpenFails { permission_denied }) => {
                debug!("sim: refusing to open {}", address);
                if permission_denied {
                    Err(DetectError::PermissionDenied {
                        device: address.to_string(),
                        reason: "pairing rejected".to_string(),
                    })
                } else {
                    Err(DetectError::TransportUnavailable {
                        device: address.to_string(),
                        reason: "device not responding".to_string(),
                    })
                }
            }
            Some(behavior) => Ok(behavior),
        };

        let address = address.to_string();
        match result {
            Ok(behavior) => {
                self.record(IoEvent::Open {
                    address: address.clone(),
                    baud_rate,
                });
                Ok(Box::new(SimulatedLink::new(
                    address,
                    behavior,
                    baud_rate,
                    Arc::clone(&self.journal),
                )))
            }
            Err(e) => {
                self.record(IoEvent::OpenFailed { address, baud_rate });
                Err(e)
            }
        }
    }
}

/// A transport enumerating ports on a [`SimulatedBus`]
pub struct SimulatedTransport {
    name: String,
    kind: DeviceKind,
    bus: Arc<SimulatedBus>,
    listed: Vec<(String, String)>,
    discovered: Vec<(String, String)>,
    exhaustive_prefix: Option<String>,
    fail_enumeration: bool,
}

impl SimulatedTransport {
    /// Create a transport whose devices are of `kind`
    pub fn new(name: impl Into<String>, kind: DeviceKind, bus: Arc<SimulatedBus>) -> Self {
        Self {
            name: name.into(),
            kind,
            bus,
            listed: Vec::new(),
            discovered: Vec::new(),
            exhaustive_prefix: None,
            fail_enumeration: false,
        }
    }

    /// Wired serial transport
    pub fn serial(bus: Arc<SimulatedBus>) -> Self {
        Self::new("sim-serial", DeviceKind::Serial, bus)
    }

    /// Bluetooth transport
    pub fn bluetooth(bus: Arc<SimulatedBus>) -> Self {
        Self::new("sim-bluetooth", DeviceKind::Bluetooth, bus)
    }

    /// List `address` during enumeration
    pub fn with_port(mut self, address: impl Into<String>, friendly_name: impl Into<String>) -> Self {
        self.listed.push((address.into(), friendly_name.into()));
        self
    }

    /// Report `address` through the discovery stream
    pub fn with_discovered(
        mut self,
        address: impl Into<String>,
        friendly_name: impl Into<String>,
    ) -> Self {
        self.discovered
            .push((address.into(), friendly_name.into()));
        self
    }

    /// Generate `<prefix>N` names for exhaustive scans
    pub fn with_exhaustive_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.exhaustive_prefix = Some(prefix.into());
        self
    }

    /// Make enumeration fail
    pub fn failing(mut self) -> Self {
        self.fail_enumeration = true;
        self
    }

    fn candidate(&self, address: &str, friendly_name: &str) -> CandidatePort {
        let opener: Arc<dyn LinkOpener> = self.bus.clone();
        CandidatePort::new(address, self.kind, friendly_name, opener)
    }
}

impl TransportEnumerator for SimulatedTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_candidates(&self) -> Result<Vec<CandidatePort>, DetectError> {
        if self.fail_enumeration {
            return Err(DetectError::EnumerationFailed(format!(
                "{} is not available",
                self.name
            )));
        }
        Ok(self
            .listed
            .iter()
            .map(|(address, name)| self.candidate(address, name))
            .collect())
    }

    fn exhaustive_candidates(&self, max_port_number: u32) -> Vec<CandidatePort> {
        let Some(prefix) = &self.exhaustive_prefix else {
            return Vec::new();
        };
        numbered_port_names(prefix, max_port_number)
            .iter()
            .map(|address| self.candidate(address, address))
            .collect()
    }

    fn start_discovery(&self) -> Option<mpsc::Receiver<CandidatePort>> {
        if self.discovered.is_empty() {
            return None;
        }

        let (tx, rx) = mpsc::channel(self.discovered.len());
        for (address, name) in &self.discovered {
            // Capacity matches the list, so this cannot be full
            let _ = tx.try_send(self.candidate(address, name));
        }
        Some(rx)
    }
}
