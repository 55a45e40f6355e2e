//! Error types for the locator

use fix_detect::DetectError;
use thiserror::Error;

/// Invalid locator configuration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Exhaustive scan range outside the supported bounds
    #[error("max serial port number must be between 0 and {max}, got {value}")]
    PortNumberOutOfRange { value: i64, max: u32 },

    /// A duration that must be positive was zero or negative
    #[error("{name} must be greater than zero")]
    NonPositiveDuration { name: &'static str },

    /// The sniffer has no rates to try
    #[error("at least one baud rate is required")]
    NoBaudRates,
}

/// Errors surfaced to callers of the locator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocatorError {
    /// No device was ever confirmed and nothing failed along the way
    #[error("no location device found")]
    NotFound,

    /// Devices exist but the transport failed
    #[error(transparent)]
    Transport(#[from] DetectError),

    /// Configuration rejected at construction
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
