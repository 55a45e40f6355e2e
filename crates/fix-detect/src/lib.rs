//! Location Device Detection Library
//!
//! This crate finds devices that stream location sentences over serial-like
//! transports. It provides:
//!
//! - **PortScanner**: enumerates serial and Bluetooth virtual ports
//! - **ProtocolSniffer**: scans baud rates for sentence traffic
//! - **Device**: per-address detection lifecycle with cancellation
//! - **ProfileStore**: persisted reliability history per device
//!
//! # Example
//!
//! ```rust,no_run
//! use fix_detect::{PortScanner, TransportEnumerator};
//!
//! let scanner = PortScanner::new();
//! for candidate in scanner.list_candidates().unwrap() {
//!     println!("Found {} ({})", candidate.address, candidate.kind);
//! }
//! ```

pub mod device;
pub mod error;
pub mod link;
pub mod reliability;
pub mod scanner;
pub mod sniffer;

pub use device::{
    DetectionContext, DetectionObserver, DetectionOutcome, DetectionPolicy, Device, DeviceKind,
    DevicePhase, ExclusionReason, DEFAULT_MAX_ALLOWED_FAILURES, NMEA_BAUD_RATE,
};
pub use error::{DetectError, StoreError};
pub use link::{LinkOpener, SerialLink, SerialPortOpener};
pub use reliability::{JsonProfileStore, MemoryProfileStore, ProfileStore, ReliabilityProfile};
pub use scanner::{
    numbered_port_names, CandidatePort, PortScanner, ScannerConfig, SerialPortInfo,
    TransportEnumerator,
};
pub use sniffer::{ProtocolSniffer, SniffTarget, SnifferConfig, DEFAULT_BAUD_RATES};
