//! Locator configuration

use std::time::Duration;

use fix_detect::{DetectionPolicy, SnifferConfig, DEFAULT_MAX_ALLOWED_FAILURES};

use crate::error::ConfigError;

/// Highest port number an exhaustive scan may reach
pub const MAX_SERIAL_PORT_NUMBER_LIMIT: u32 = 100;

/// Configuration for a [`Locator`](crate::Locator)
#[derive(Debug, Clone)]
pub struct LocatorConfig {
    /// Probe Bluetooth virtual ports
    pub allow_bluetooth: bool,
    /// Probe wired serial ports
    pub allow_serial: bool,
    /// Probe platform multiplexers
    pub allow_multiplexer: bool,
    /// Also probe numbered serial ports the OS does not report
    pub allow_exhaustive_serial_scan: bool,
    /// Exhaustive scans cover port numbers `0..max_serial_port_number`
    pub max_serial_port_number: i64,
    /// Budget for one detection session before the watchdog cancels it
    pub detection_timeout: Duration,
    /// Cancel the session as soon as one device is confirmed
    pub only_first_device_detected: bool,
    /// Failures after which a never-successful device stops being probed
    pub max_allowed_failures: u32,
    /// How long connection acquisition waits for a first confirmed device
    pub device_wait_timeout: Duration,
    /// How long cancellation waits for each device to acknowledge
    pub cancellation_timeout: Duration,
    /// Sniffer settings shared by every device
    pub sniffer: SnifferConfig,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            allow_bluetooth: true,
            allow_serial: true,
            allow_multiplexer: true,
            allow_exhaustive_serial_scan: false,
            max_serial_port_number: 20,
            detection_timeout: Duration::from_secs(20 * 60),
            only_first_device_detected: false,
            max_allowed_failures: DEFAULT_MAX_ALLOWED_FAILURES,
            device_wait_timeout: Duration::from_secs(60),
            cancellation_timeout: Duration::from_secs(5),
            sniffer: SnifferConfig::default(),
        }
    }
}

impl LocatorConfig {
    /// Check option ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0..=MAX_SERIAL_PORT_NUMBER_LIMIT as i64).contains(&self.max_serial_port_number) {
            return Err(ConfigError::PortNumberOutOfRange {
                value: self.max_serial_port_number,
                max: MAX_SERIAL_PORT_NUMBER_LIMIT,
            });
        }

        let durations = [
            ("detection timeout", self.detection_timeout),
            ("device wait timeout", self.device_wait_timeout),
            ("cancellation timeout", self.cancellation_timeout),
            ("sniffer read timeout", self.sniffer.read_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::NonPositiveDuration { name: *name });
        }

        if self.sniffer.baud_rates.is_empty() {
            return Err(ConfigError::NoBaudRates);
        }

        Ok(())
    }

    /// Device-level policy derived from these options
    pub fn policy(&self) -> DetectionPolicy {
        DetectionPolicy {
            allow_serial: self.allow_serial,
            allow_bluetooth: self.allow_bluetooth,
            allow_multiplexer: self.allow_multiplexer,
            max_allowed_failures: self.max_allowed_failures,
        }
    }

    /// Number of ports an exhaustive scan covers
    pub fn exhaustive_port_count(&self) -> u32 {
        u32::try_from(self.max_serial_port_number)
            .unwrap_or(0)
            .min(MAX_SERIAL_PORT_NUMBER_LIMIT)
    }
}
