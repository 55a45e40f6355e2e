//! Detection events and status
//!
//! Events are point-in-time notifications broadcast to every subscriber.
//! [`DetectionStatus`] is the queryable counterpart, kept in a watch channel
//! so waiters can block on it.

use fix_detect::{DetectError, DeviceKind};

/// Notification emitted by the locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionEvent {
    /// A detection session started
    DetectionStarted {
        /// Session number
        session: u64,
    },

    /// A transport reported a device not seen before
    DeviceDiscovered {
        /// Device address
        address: String,
        /// Transport category
        kind: DeviceKind,
        /// Display name
        friendly_name: String,
    },

    /// A device began channel I/O
    AttemptStarted {
        /// Device address
        address: String,
    },

    /// A device's attempt failed
    AttemptFailed {
        /// Device address
        address: String,
        /// Why it failed
        cause: DetectError,
    },

    /// A device joined the confirmed set
    DeviceConfirmed {
        /// Device address
        address: String,
        /// Rate the protocol was confirmed at
        baud_rate: Option<u32>,
    },

    /// The session was canceled (explicitly, by policy or by the watchdog)
    DetectionCanceled {
        /// Session number
        session: u64,
    },

    /// Every device in the session finished
    DetectionCompleted {
        /// Session number
        session: u64,
        /// Confirmed devices at completion
        confirmed: usize,
    },
}

/// Phase of the current detection session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No session has run yet
    #[default]
    Idle,
    /// Enumerating candidates
    Starting,
    /// Devices are being probed
    Running,
    /// Every device finished
    Completed,
    /// Canceled before every device finished
    Canceled,
}

impl SessionPhase {
    /// Whether a session is in progress
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Whether the last session ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }
}

/// Snapshot of locator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetectionStatus {
    /// Current or last session number; 0 before the first session
    pub session: u64,
    /// Session phase
    pub phase: SessionPhase,
    /// Cancellation requested but not yet acknowledged
    pub canceling: bool,
    /// Devices in the confirmed set
    pub confirmed: usize,
    /// Devices known to the locator
    pub known: usize,
}
