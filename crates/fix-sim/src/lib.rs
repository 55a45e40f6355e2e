//! Location Device Simulation Library
//!
//! This crate provides simulated transports for exercising detection without
//! physical receivers. It includes:
//!
//! - **SimulatedBus**: addresses with scripted devices behind them, plus an
//!   I/O journal
//! - **SimulatedLink**: a channel that streams sentences only at the right rate
//! - **SimulatedTransport**: enumeration and discovery over a bus
//!
//! # Example
//!
//! ```rust
//! use fix_detect::{LinkOpener, TransportEnumerator};
//! use fix_sim::{SimBehavior, SimulatedBus, SimulatedTransport};
//!
//! let bus = SimulatedBus::new();
//! bus.attach("COM3", SimBehavior::Gps { native_baud: 9_600 });
//!
//! let transport = SimulatedTransport::serial(bus.clone()).with_port("COM3", "GPS 18x");
//! assert_eq!(transport.list_candidates().unwrap().len(), 1);
//!
//! let link = bus.open("COM3", 4_800).unwrap();
//! drop(link);
//! assert_eq!(bus.open_links("COM3"), 0);
//! ```

pub mod link;
pub mod scenario;
pub mod transport;

pub use link::{sentence_stream, IoEvent, Journal, SimBehavior, SimulatedLink, NOISE};
pub use scenario::Scenario;
pub use transport::{SimulatedBus, SimulatedTransport};
