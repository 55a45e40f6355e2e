//! Transport enumeration
//!
//! Enumerators report the candidate devices a transport knows about. The
//! locator merges their output into its known-device set, deduplicating by
//! address. [`PortScanner`] covers native serial ports and the Bluetooth
//! virtual ports the OS exposes alongside them.

use std::fmt;
use std::sync::Arc;

use serialport::{available_ports, SerialPortType};
use tokio::sync::mpsc;
use tracing::info;

use crate::device::DeviceKind;
use crate::error::DetectError;
use crate::link::{LinkOpener, SerialPortOpener};

/// A device reported by a transport, not yet tracked by the locator
#[derive(Clone)]
pub struct CandidatePort {
    /// Transport address (port name or hardware address)
    pub address: String,
    /// Transport category
    pub kind: DeviceKind,
    /// Human-readable name
    pub friendly_name: String,
    /// Opener for the channel behind this address
    pub opener: Arc<dyn LinkOpener>,
}

impl CandidatePort {
    /// Create a candidate
    pub fn new(
        address: impl Into<String>,
        kind: DeviceKind,
        friendly_name: impl Into<String>,
        opener: Arc<dyn LinkOpener>,
    ) -> Self {
        Self {
            address: address.into(),
            kind,
            friendly_name: friendly_name.into(),
            opener,
        }
    }
}

impl fmt::Debug for CandidatePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidatePort")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("friendly_name", &self.friendly_name)
            .finish()
    }
}

/// Source of candidate devices for one transport
pub trait TransportEnumerator: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Devices the transport currently knows about, in preference order
    fn list_candidates(&self) -> Result<Vec<CandidatePort>, DetectError>;

    /// Addresses to probe with no prior evidence of a device, numbered
    /// `0..max_port_number`
    fn exhaustive_candidates(&self, _max_port_number: u32) -> Vec<CandidatePort> {
        Vec::new()
    }

    /// Start discovering devices that appear after enumeration
    ///
    /// The enumerator closes the stream when discovery is over.
    fn start_discovery(&self) -> Option<mpsc::Receiver<CandidatePort>> {
        None
    }
}

/// Port names `<prefix>0` up to, but not including, `<prefix><max_port_number>`
pub fn numbered_port_names(prefix: &str, max_port_number: u32) -> Vec<String> {
    (0..max_port_number)
        .map(|n| format!("{}{}", prefix, n))
        .collect()
}

/// Information about a serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., /dev/ttyUSB0, COM3)
    pub port: String,
    /// Serial or Bluetooth virtual port
    pub kind: DeviceKind,
    /// USB Vendor ID (if USB)
    pub vid: Option<u16>,
    /// USB Product ID (if USB)
    pub pid: Option<u16>,
    /// USB manufacturer string
    pub manufacturer: Option<String>,
    /// USB product string
    pub product: Option<String>,
}

impl SerialPortInfo {
    /// Create from serialport crate's port info
    fn from_serialport(name: String, port_type: &SerialPortType) -> Self {
        match port_type {
            SerialPortType::UsbPort(usb) => Self {
                port: name,
                kind: DeviceKind::Serial,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer.clone(),
                product: usb.product.clone(),
            },
            SerialPortType::BluetoothPort => Self {
                port: name,
                kind: DeviceKind::Bluetooth,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
            },
            _ => Self {
                port: name,
                kind: DeviceKind::Serial,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
            },
        }
    }

    /// Name shown to users: the USB product string when there is one
    pub fn friendly_name(&self) -> String {
        self.product.clone().unwrap_or_else(|| self.port.clone())
    }
}

/// Serial port scanner configuration
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Skip ports matching these patterns
    pub skip_patterns: Vec<String>,
    /// Prefix of numbered port names used by exhaustive scans
    pub port_prefix: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            skip_patterns: vec![
                // Debug/logging ports
                "debug".to_string(),
            ],
            port_prefix: if cfg!(windows) { "COM" } else { "/dev/ttyS" }.to_string(),
        }
    }
}

/// Serial port scanner
pub struct PortScanner {
    config: ScannerConfig,
    opener: Arc<dyn LinkOpener>,
}

impl PortScanner {
    /// Create a new scanner with default configuration
    pub fn new() -> Self {
        Self::with_config(ScannerConfig::default())
    }

    /// Create a scanner with custom configuration
    pub fn with_config(config: ScannerConfig) -> Self {
        Self {
            config,
            opener: Arc::new(SerialPortOpener::new()),
        }
    }

    /// Enumerate all available serial ports
    pub fn enumerate_ports(&self) -> Result<Vec<SerialPortInfo>, DetectError> {
        info!("Enumerating serial ports...");
        let ports = available_ports()?;

        let result: Vec<_> = ports
            .into_iter()
            .map(|p| SerialPortInfo::from_serialport(p.port_name, &p.port_type))
            .filter(|p| !self.should_skip_port(p))
            .collect();

        if result.is_empty() {
            info!("No serial ports found");
        } else {
            info!("Found {} serial port(s)", result.len());
            for port in &result {
                info!("  {} - {} ({})", port.port, port.friendly_name(), port.kind);
            }
        }

        Ok(result)
    }

    /// Check if a port should be skipped
    fn should_skip_port(&self, port: &SerialPortInfo) -> bool {
        self.config
            .skip_patterns
            .iter()
            .any(|pattern| port.port.contains(pattern.as_str()))
    }
}

impl Default for PortScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportEnumerator for PortScanner {
    fn name(&self) -> &str {
        "serial"
    }

    fn list_candidates(&self) -> Result<Vec<CandidatePort>, DetectError> {
        Ok(self
            .enumerate_ports()?
            .into_iter()
            .map(|port| {
                let friendly_name = port.friendly_name();
                CandidatePort::new(port.port, port.kind, friendly_name, Arc::clone(&self.opener))
            })
            .collect())
    }

    fn exhaustive_candidates(&self, max_port_number: u32) -> Vec<CandidatePort> {
        numbered_port_names(&self.config.port_prefix, max_port_number)
            .into_iter()
            .map(|name| {
                CandidatePort::new(
                    name.clone(),
                    DeviceKind::Serial,
                    name,
                    Arc::clone(&self.opener),
                )
            })
            .collect()
    }
}
