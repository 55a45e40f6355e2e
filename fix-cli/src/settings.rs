//! Application settings

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use fix_detect::{SnifferConfig, DEFAULT_BAUD_RATES, DEFAULT_MAX_ALLOWED_FAILURES};
use fix_locator::{ConfigError, LocatorConfig};
use serde::{Deserialize, Serialize};

/// Persisted locator options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_true")]
    pub allow_bluetooth: bool,
    #[serde(default = "default_true")]
    pub allow_serial: bool,
    #[serde(default = "default_true")]
    pub allow_multiplexer: bool,
    #[serde(default)]
    pub allow_exhaustive_serial_scan: bool,
    #[serde(default = "default_max_port_number")]
    pub max_serial_port_number: i64,
    /// Session budget in seconds
    #[serde(default = "default_detection_timeout")]
    pub detection_timeout_secs: u64,
    #[serde(default)]
    pub only_first_device_detected: bool,
    #[serde(default = "default_max_failures")]
    pub max_allowed_failures: u32,
    /// How long `acquire` waits for a first device, in seconds
    #[serde(default = "default_device_wait")]
    pub device_wait_timeout_secs: u64,
    #[serde(default = "default_cancellation_timeout")]
    pub cancellation_timeout_ms: u64,
    /// Per-read sniff timeout
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Rates tried after a device's last successful rate, in order
    #[serde(default = "default_baud_rates")]
    pub baud_rates: Vec<u32>,
}

fn default_true() -> bool {
    true
}

fn default_max_port_number() -> i64 {
    20
}

fn default_detection_timeout() -> u64 {
    20 * 60
}

fn default_max_failures() -> u32 {
    DEFAULT_MAX_ALLOWED_FAILURES
}

fn default_device_wait() -> u64 {
    60
}

fn default_cancellation_timeout() -> u64 {
    5_000
}

fn default_read_timeout() -> u64 {
    1_000
}

fn default_baud_rates() -> Vec<u32> {
    DEFAULT_BAUD_RATES.to_vec()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            allow_bluetooth: true,
            allow_serial: true,
            allow_multiplexer: true,
            allow_exhaustive_serial_scan: false,
            max_serial_port_number: default_max_port_number(),
            detection_timeout_secs: default_detection_timeout(),
            only_first_device_detected: false,
            max_allowed_failures: default_max_failures(),
            device_wait_timeout_secs: default_device_wait(),
            cancellation_timeout_ms: default_cancellation_timeout(),
            read_timeout_ms: default_read_timeout(),
            baud_rates: default_baud_rates(),
        }
    }
}

impl Settings {
    /// Get the XDG config directory for fixfinder
    /// Uses $XDG_CONFIG_HOME/fixfinder, falls back to ~/.config/fixfinder
    pub fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("fixfinder"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("fixfinder"))
    }

    /// Default settings file path
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Default reliability profile store path
    pub fn profiles_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("profiles.json"))
    }

    /// Load settings from `path`, falling back to defaults when it is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(json) => serde_json::from_str(&json)
                .with_context(|| format!("Failed to parse settings in {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read settings from {}", path.display()))
            }
        }
    }

    /// Save settings to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create settings directory")?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;

        Ok(())
    }
}

impl TryFrom<&Settings> for LocatorConfig {
    type Error = ConfigError;

    fn try_from(settings: &Settings) -> Result<Self, Self::Error> {
        let config = LocatorConfig {
            allow_bluetooth: settings.allow_bluetooth,
            allow_serial: settings.allow_serial,
            allow_multiplexer: settings.allow_multiplexer,
            allow_exhaustive_serial_scan: settings.allow_exhaustive_serial_scan,
            max_serial_port_number: settings.max_serial_port_number,
            detection_timeout: Duration::from_secs(settings.detection_timeout_secs),
            only_first_device_detected: settings.only_first_device_detected,
            max_allowed_failures: settings.max_allowed_failures,
            device_wait_timeout: Duration::from_secs(settings.device_wait_timeout_secs),
            cancellation_timeout: Duration::from_millis(settings.cancellation_timeout_ms),
            sniffer: SnifferConfig {
                read_timeout: Duration::from_millis(settings.read_timeout_ms),
                baud_rates: settings.baud_rates.clone(),
                ..Default::default()
            },
        };
        config.validate()?;
        Ok(config)
    }
}
