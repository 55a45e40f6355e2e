//! Error types for device detection

use thiserror::Error;

/// Errors that can occur during detection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DetectError {
    /// Failed to enumerate transport candidates
    #[error("failed to enumerate ports: {0}")]
    EnumerationFailed(String),

    /// Device or its transport category is disabled, or its failure budget is spent
    #[error("{device} excluded from detection: {reason}")]
    PolicyExcluded { device: String, reason: String },

    /// Channel cannot be opened (missing or misconfigured)
    #[error("failed to open {device}: {reason}")]
    TransportUnavailable { device: String, reason: String },

    /// Pairing or security rejection while opening the channel
    #[error("permission denied opening {device}: {reason}")]
    PermissionDenied { device: String, reason: String },

    /// Channel opened fine but carried no recognizable data at any tested rate
    #[error("no protocol data found on {device} at any tested rate")]
    ProtocolMismatch { device: String },

    /// Unexpected I/O failure mid-sniff
    #[error("I/O error on {device}: {reason}")]
    TransportError { device: String, reason: String },

    /// Channel went quiet after showing a plausible signal
    #[error("timeout reading from {device}")]
    Timeout { device: String },

    /// Detection was canceled before it finished
    #[error("detection canceled on {device}")]
    Canceled { device: String },
}

impl DetectError {
    /// Whether this error means the transport itself is unreachable or failing
    ///
    /// Policy exclusions, protocol mismatches and cancellations are expected
    /// outcomes and are not transport-level.
    pub fn is_transport_level(&self) -> bool {
        matches!(
            self,
            DetectError::TransportUnavailable { .. }
                | DetectError::PermissionDenied { .. }
                | DetectError::TransportError { .. }
                | DetectError::Timeout { .. }
        )
    }

    /// Whether this error records a cancellation
    pub fn is_canceled(&self) -> bool {
        matches!(self, DetectError::Canceled { .. })
    }

    /// Map an I/O error raised while opening `device`
    pub fn from_open_error(device: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => DetectError::PermissionDenied {
                device: device.to_string(),
                reason: err.to_string(),
            },
            _ => DetectError::TransportUnavailable {
                device: device.to_string(),
                reason: err.to_string(),
            },
        }
    }

    /// Map an I/O error raised on an already open `device`
    pub fn from_io_error(device: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => DetectError::Timeout {
                device: device.to_string(),
            },
            _ => DetectError::TransportError {
                device: device.to_string(),
                reason: err.to_string(),
            },
        }
    }
}

impl From<serialport::Error> for DetectError {
    fn from(err: serialport::Error) -> Self {
        DetectError::EnumerationFailed(err.to_string())
    }
}

/// Errors raised by a reliability profile store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store backing file could not be read or written
    #[error("profile store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored document is not valid
    #[error("profile store format error: {0}")]
    Format(#[from] serde_json::Error),
}
