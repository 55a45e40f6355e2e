//! Device lifecycle
//!
//! A [`Device`] is one candidate transport address. It owns its reliability
//! profile, runs detection on its own task, and can hold an open connection
//! once detection has confirmed it.
//!
//! Detection moves through `Idle -> Opening -> Sniffing -> Confirmed |
//! Rejected`, with `Canceling` reachable from `Opening` and `Sniffing`. A
//! device never runs two detections at once: starting one while another is
//! active is a no-op.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::DetectError;
use crate::link::{LinkOpener, SerialLink};
use crate::reliability::{ProfileStore, ReliabilityProfile};
use crate::scanner::CandidatePort;
use crate::sniffer::{ProtocolSniffer, SniffTarget};

/// Standard sentence rate, used when a device has no history
pub const NMEA_BAUD_RATE: u32 = 4_800;

/// Failures tolerated from a device that has never succeeded
pub const DEFAULT_MAX_ALLOWED_FAILURES: u32 = 100;

/// Transport category of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Wired serial port (native, USB or PCI)
    Serial,
    /// Bluetooth virtual serial port
    Bluetooth,
    /// Platform multiplexer sharing one receiver between applications
    Multiplexer,
}

impl DeviceKind {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Serial => "Serial",
            Self::Bluetooth => "Bluetooth",
            Self::Multiplexer => "Multiplexer",
        }
    }

    /// Whether the transport is wireless
    pub fn is_wireless(&self) -> bool {
        matches!(self, Self::Bluetooth)
    }

    /// Whether the channel speed is meaningful for this transport
    ///
    /// Multiplexers hand out already-decoded streams at a fixed rate.
    pub fn scans_baud_rates(&self) -> bool {
        !matches!(self, Self::Multiplexer)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which devices may be probed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionPolicy {
    /// Probe wired serial ports
    pub allow_serial: bool,
    /// Probe Bluetooth virtual ports
    pub allow_bluetooth: bool,
    /// Probe platform multiplexers
    pub allow_multiplexer: bool,
    /// Failures after which a never-successful device stops being probed
    pub max_allowed_failures: u32,
}

impl DetectionPolicy {
    /// Whether the transport category is enabled
    pub fn allows(&self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::Serial => self.allow_serial,
            DeviceKind::Bluetooth => self.allow_bluetooth,
            DeviceKind::Multiplexer => self.allow_multiplexer,
        }
    }
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self {
            allow_serial: true,
            allow_bluetooth: true,
            allow_multiplexer: true,
            max_allowed_failures: DEFAULT_MAX_ALLOWED_FAILURES,
        }
    }
}

/// Why a device was skipped without touching its channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionReason {
    /// Connections are disabled for this device
    ConnectionsDisallowed,
    /// The device's transport category is disabled
    CategoryDisabled(DeviceKind),
    /// The device never succeeded and has failed too often
    FailureBudgetExhausted { failures: u32 },
    /// A detection is already running on this device
    DetectionInProgress,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionsDisallowed => write!(f, "connections disallowed"),
            Self::CategoryDisabled(kind) => write!(f, "{} devices disabled", kind),
            Self::FailureBudgetExhausted { failures } => {
                write!(f, "{} failures without a success", failures)
            }
            Self::DetectionInProgress => write!(f, "detection already in progress"),
        }
    }
}

/// Result of one detection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// Protocol confirmed at this rate
    Confirmed { baud_rate: u32 },
    /// Channel opened but no protocol data was found
    Rejected { reason: String },
    /// Skipped by policy; no I/O attempted
    Excluded { reason: ExclusionReason },
    /// Channel failed, or detection was canceled
    TransportError { cause: DetectError },
}

impl DetectionOutcome {
    /// Whether the protocol was confirmed
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }

    /// Whether the attempt ended by cancellation
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::TransportError { cause } if cause.is_canceled())
    }

    /// Whether this outcome counts as a failed attempt
    pub fn is_failure(&self) -> bool {
        match self {
            Self::Rejected { .. } => true,
            Self::TransportError { cause } => !cause.is_canceled(),
            _ => false,
        }
    }

    /// The error reported to observers for a failed attempt on `device`
    pub fn failure_cause(&self, device: &str) -> Option<DetectError> {
        match self {
            Self::Rejected { .. } => Some(DetectError::ProtocolMismatch {
                device: device.to_string(),
            }),
            Self::TransportError { cause } if !cause.is_canceled() => Some(cause.clone()),
            _ => None,
        }
    }
}

/// Where a device is in its detection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePhase {
    /// Not detecting
    #[default]
    Idle,
    /// Opening the channel
    Opening,
    /// Scanning rates for sentences
    Sniffing,
    /// Cancellation requested, waiting for the detection task to exit
    Canceling,
    /// Last detection confirmed the protocol
    Confirmed,
    /// Last detection did not
    Rejected,
}

impl DevicePhase {
    /// Whether a detection task is running
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Opening | Self::Sniffing | Self::Canceling)
    }
}

/// Receives detection progress from devices
pub trait DetectionObserver: Send + Sync {
    /// Channel I/O is about to begin
    fn attempt_started(&self, device: &Arc<Device>);

    /// Detection finished with `outcome`
    ///
    /// Called before the device leaves its active phase, so a waiter on the
    /// device's completion always sees the observer's side effects.
    fn attempt_finished(&self, device: &Arc<Device>, outcome: &DetectionOutcome);
}

/// Everything a detection run needs besides the device itself
#[derive(Clone)]
pub struct DetectionContext {
    /// Which devices may be probed
    pub policy: DetectionPolicy,
    /// Sniffer used for the channel
    pub sniffer: Arc<ProtocolSniffer>,
    /// Progress receiver
    pub observer: Arc<dyn DetectionObserver>,
}

struct DeviceState {
    profile: ReliabilityProfile,
    allow_connections: bool,
    connection: Option<Box<dyn SerialLink>>,
    connection_baud: Option<u32>,
    last_outcome: Option<DetectionOutcome>,
}

/// A candidate location device
pub struct Device {
    address: String,
    kind: DeviceKind,
    opener: Arc<dyn LinkOpener>,
    store: Arc<dyn ProfileStore>,
    state: Mutex<DeviceState>,
    phase: watch::Sender<DevicePhase>,
    cancel: watch::Sender<bool>,
}

impl Device {
    /// Create a device for `candidate`, loading its profile from `store`
    pub fn new(candidate: CandidatePort, store: Arc<dyn ProfileStore>) -> Arc<Self> {
        let profile = match store.read(&candidate.address) {
            Ok(Some(mut profile)) => {
                if profile.friendly_name.is_empty() {
                    profile.friendly_name = candidate.friendly_name.clone();
                }
                profile
            }
            Ok(None) => ReliabilityProfile::new(candidate.friendly_name.clone()),
            Err(e) => {
                warn!("Failed to read profile for {}: {}", candidate.address, e);
                ReliabilityProfile::new(candidate.friendly_name.clone())
            }
        };

        let device = Arc::new(Self {
            address: candidate.address,
            kind: candidate.kind,
            opener: candidate.opener,
            store,
            state: Mutex::new(DeviceState {
                profile: profile.clone(),
                allow_connections: true,
                connection: None,
                connection_baud: None,
                last_outcome: None,
            }),
            phase: watch::channel(DevicePhase::Idle).0,
            cancel: watch::channel(false).0,
        });
        device.persist(&profile);
        device
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `profile` to the store, logging failures
    fn persist(&self, profile: &ReliabilityProfile) {
        if let Err(e) = self.store.write(&self.address, profile) {
            warn!("Failed to persist profile for {}: {}", self.address, e);
        }
    }

    /// Transport address; the device's identity
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Transport category
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Display name
    pub fn friendly_name(&self) -> String {
        self.lock().profile.friendly_name.clone()
    }

    /// Snapshot of the reliability profile
    pub fn profile(&self) -> ReliabilityProfile {
        self.lock().profile.clone()
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> DevicePhase {
        *self.phase.borrow()
    }

    /// Whether a detection task is running
    pub fn is_detecting(&self) -> bool {
        self.phase().is_active()
    }

    /// Whether a connection is open
    pub fn is_open(&self) -> bool {
        self.lock().connection.is_some()
    }

    /// Baud rate of the open connection
    pub fn connection_baud(&self) -> Option<u32> {
        self.lock().connection_baud
    }

    /// Whether connections to this device are allowed
    pub fn allows_connections(&self) -> bool {
        self.lock().allow_connections
    }

    /// Allow or forbid connections to this device
    pub fn set_allow_connections(&self, allow: bool) {
        self.lock().allow_connections = allow;
    }

    /// Outcome of the most recent detection that touched the channel
    pub fn last_outcome(&self) -> Option<DetectionOutcome> {
        self.lock().last_outcome.clone()
    }

    /// Why detection would skip this device, if it would
    pub fn exclusion(&self, policy: &DetectionPolicy) -> Option<ExclusionReason> {
        let state = self.lock();
        if !state.allow_connections {
            return Some(ExclusionReason::ConnectionsDisallowed);
        }
        if !policy.allows(self.kind) {
            return Some(ExclusionReason::CategoryDisabled(self.kind));
        }
        if state.profile.is_unproductive(policy.max_allowed_failures) {
            return Some(ExclusionReason::FailureBudgetExhausted {
                failures: state.profile.fail_count,
            });
        }
        None
    }

    /// Whether detection may be started on this device now
    pub fn is_eligible(&self, policy: &DetectionPolicy) -> bool {
        !self.is_detecting() && self.exclusion(policy).is_none()
    }

    /// Move to `Opening` unless a detection is already active
    fn try_claim(&self) -> bool {
        self.phase.send_if_modified(|phase| {
            if phase.is_active() {
                return false;
            }
            *phase = DevicePhase::Opening;
            self.cancel.send_replace(false);
            true
        })
    }

    /// Start detection on a dedicated task
    ///
    /// Returns `false` without doing anything if a detection is already
    /// running. Must be called from within a tokio runtime.
    pub fn begin_detection(self: &Arc<Self>, ctx: DetectionContext) -> bool {
        if !self.try_claim() {
            debug!("{}: detection already running", self.address);
            return false;
        }

        let device = Arc::clone(self);
        tokio::spawn(async move {
            device.run_detection(&ctx).await;
        });
        true
    }

    /// Run detection on the calling task and return its outcome
    pub async fn detect_protocol(self: &Arc<Self>, ctx: &DetectionContext) -> DetectionOutcome {
        if !self.try_claim() {
            return DetectionOutcome::Excluded {
                reason: ExclusionReason::DetectionInProgress,
            };
        }
        self.run_detection(ctx).await
    }

    async fn run_detection(self: &Arc<Self>, ctx: &DetectionContext) -> DetectionOutcome {
        if let Some(reason) = self.exclusion(&ctx.policy) {
            debug!("{}: skipped ({})", self.address, reason);
            let outcome = DetectionOutcome::Excluded { reason };
            ctx.observer.attempt_finished(self, &outcome);
            self.phase.send_replace(DevicePhase::Idle);
            return outcome;
        }

        ctx.observer.attempt_started(self);
        let outcome = self.sniff_channel(&ctx.sniffer).await;
        self.record(&outcome);
        ctx.observer.attempt_finished(self, &outcome);

        let settled = match &outcome {
            DetectionOutcome::Confirmed { .. } => DevicePhase::Confirmed,
            o if o.is_canceled() => DevicePhase::Idle,
            _ => DevicePhase::Rejected,
        };
        self.phase.send_replace(settled);
        outcome
    }

    async fn sniff_channel(&self, sniffer: &ProtocolSniffer) -> DetectionOutcome {
        let mut cancel_rx = self.cancel.subscribe();
        if *cancel_rx.borrow() {
            return self.canceled();
        }

        if self.close() {
            debug!("{}: closed open connection before detection", self.address);
        }

        let last_success = self.lock().profile.last_success_baud;
        let rates = if self.kind.scans_baud_rates() {
            sniffer.candidate_baud_rates(last_success)
        } else {
            vec![last_success.unwrap_or(NMEA_BAUD_RATE)]
        };

        let Some(&first_rate) = rates.first() else {
            return DetectionOutcome::Rejected {
                reason: "no baud rates to try".to_string(),
            };
        };

        let mut link = match self.opener.open(&self.address, first_rate) {
            Ok(link) => link,
            Err(cause) => return DetectionOutcome::TransportError { cause },
        };

        self.phase.send_if_modified(|phase| {
            if *phase == DevicePhase::Opening {
                *phase = DevicePhase::Sniffing;
                true
            } else {
                false
            }
        });

        let target = SniffTarget {
            address: &self.address,
            opener: self.opener.as_ref(),
        };
        let result = tokio::select! {
            biased;
            _ = canceled(&mut cancel_rx) => None,
            result = sniffer.sniff(&mut link, target, &rates) => Some(result),
        };
        drop(link);

        match result {
            None => self.canceled(),
            Some(Ok(Some(baud_rate))) => DetectionOutcome::Confirmed { baud_rate },
            Some(Ok(None)) => DetectionOutcome::Rejected {
                reason: "no protocol data found at any tested rate".to_string(),
            },
            Some(Err(cause)) => DetectionOutcome::TransportError { cause },
        }
    }

    fn canceled(&self) -> DetectionOutcome {
        debug!("{}: detection canceled", self.address);
        DetectionOutcome::TransportError {
            cause: DetectError::Canceled {
                device: self.address.clone(),
            },
        }
    }

    /// Update and persist the profile for a finished attempt
    fn record(&self, outcome: &DetectionOutcome) {
        let profile = {
            let mut state = self.lock();
            match outcome {
                DetectionOutcome::Confirmed { baud_rate } => {
                    state.profile.record_success(*baud_rate)
                }
                o if o.is_failure() => state.profile.record_failure(),
                _ => return,
            }
            state.last_outcome = Some(outcome.clone());
            state.profile.clone()
        };
        self.persist(&profile);
    }

    /// Request cancellation and wait up to `ack_timeout` for the task to exit
    ///
    /// The detection task drops its channel before acknowledging, which
    /// unblocks any pending read. Returns whether the device is idle.
    pub async fn cancel_detection(&self, ack_timeout: Duration) -> bool {
        let requested = self.phase.send_if_modified(|phase| match phase {
            DevicePhase::Opening | DevicePhase::Sniffing => {
                *phase = DevicePhase::Canceling;
                true
            }
            _ => false,
        });

        if requested {
            debug!("{}: cancellation requested", self.address);
            self.cancel.send_replace(true);
        } else if !self.is_detecting() {
            return true;
        }

        timeout(ack_timeout, self.detection_finished()).await.is_ok()
    }

    /// Wait until no detection is running
    pub async fn detection_finished(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| !phase.is_active()).await;
    }

    /// Wait until the device has finished opening its channel
    pub async fn opening_finished(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase != DevicePhase::Opening).await;
    }

    /// Open a connection at the last successful rate
    pub fn open(&self) -> Result<(), DetectError> {
        if self.is_detecting() {
            return Err(DetectError::TransportUnavailable {
                device: self.address.clone(),
                reason: "detection in progress".to_string(),
            });
        }

        let baud = {
            let state = self.lock();
            if !state.allow_connections {
                return Err(DetectError::PolicyExcluded {
                    device: self.address.clone(),
                    reason: ExclusionReason::ConnectionsDisallowed.to_string(),
                });
            }
            if state.connection.is_some() {
                return Ok(());
            }
            state.profile.last_success_baud.unwrap_or(NMEA_BAUD_RATE)
        };

        let link = self.opener.open(&self.address, baud)?;
        let profile = {
            let mut state = self.lock();
            if state.connection.is_some() {
                return Ok(());
            }
            state.connection = Some(link);
            state.connection_baud = Some(baud);
            state.profile.record_connected();
            state.profile.clone()
        };
        self.persist(&profile);

        info!("Opened {} at {} baud", self.address, baud);
        Ok(())
    }

    /// Close the connection, returning whether one was open
    pub fn close(&self) -> bool {
        self.take_connection().is_some()
    }

    /// Take ownership of the open connection
    pub fn take_connection(&self) -> Option<Box<dyn SerialLink>> {
        let mut state = self.lock();
        state.connection_baud = None;
        state.connection.take()
    }

    /// Discard the open channel and reopen it with the same configuration
    ///
    /// Recovers from platform drivers leaving a handle unusable after failed
    /// attempts. Does nothing when no connection is open.
    pub fn reset(&self) -> Result<(), DetectError> {
        let baud = {
            let mut state = self.lock();
            let Some(old) = state.connection.take() else {
                return Ok(());
            };
            drop(old);
            state.connection_baud.take().unwrap_or(NMEA_BAUD_RATE)
        };

        debug!("{}: resetting channel at {} baud", self.address, baud);
        let link = self.opener.open(&self.address, baud)?;

        let mut state = self.lock();
        state.connection = Some(link);
        state.connection_baud = Some(baud);
        Ok(())
    }

    /// Forget reliability history and the last detection result
    pub fn undetect(&self) {
        {
            let mut state = self.lock();
            let name = std::mem::take(&mut state.profile.friendly_name);
            state.profile = ReliabilityProfile::new(name);
            state.last_outcome = None;
        }
        self.phase.send_if_modified(|phase| {
            if matches!(phase, DevicePhase::Confirmed | DevicePhase::Rejected) {
                *phase = DevicePhase::Idle;
                true
            } else {
                false
            }
        });

        if let Err(e) = self.store.delete(&self.address) {
            warn!("Failed to delete profile for {}: {}", self.address, e);
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("phase", &self.phase())
            .finish()
    }
}

async fn canceled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|canceled| *canceled).await;
}
