//! Location Device Locator
//!
//! This crate coordinates detection across every transport and picks the
//! device to use.
//!
//! # Architecture
//!
//! A [`Locator`] is built from transport enumerators and a profile store.
//! Each detection session fans out one task per device; confirmed devices
//! land in a ranked set, and [`Locator::acquire_connection`] opens the best
//! of them on demand.
//!
//! - **Ranking**: success ratio, then recency, then fewer failures
//! - **Watchdog**: sessions are canceled once they exceed their budget
//! - **Events**: every milestone is broadcast as a [`DetectionEvent`]
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fix_detect::{MemoryProfileStore, PortScanner};
//! use fix_locator::{Locator, LocatorConfig};
//!
//! # async fn run() -> Result<(), fix_locator::LocatorError> {
//! let locator = Locator::new(
//!     LocatorConfig::default(),
//!     vec![Arc::new(PortScanner::new())],
//!     Arc::new(MemoryProfileStore::new()),
//! )?;
//!
//! let device = locator.acquire_connection().await?;
//! println!("Using {} at {:?} baud", device.address(), device.connection_baud());
//! # Ok(())
//! # }
//! ```

pub mod arbiter;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod ranking;

pub use config::{LocatorConfig, MAX_SERIAL_PORT_NUMBER_LIMIT};
pub use error::{ConfigError, LocatorError};
pub use events::{DetectionEvent, DetectionStatus, SessionPhase};
pub use orchestrator::Locator;
pub use ranking::{ConfirmedDeviceSet, RankKey};
