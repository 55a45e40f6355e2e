//! Detection orchestration
//!
//! A [`Locator`] owns every piece of process-wide detection state: the known
//! devices, the ranked confirmed set, the current session and its
//! outstanding devices. All of it lives behind one mutex so confirmations
//! arriving from concurrent device tasks are serialized.
//!
//! # Sessions
//!
//! A session moves `Idle -> Starting -> Running -> Completed | Canceled`.
//! Starting one while another is active is a no-op. Each session gets:
//!
//! - a runner task that enumerates candidates, launches wired devices,
//!   then wireless devices once the wired ones have opened, drains discovery
//!   streams, and finally waits for every launched device
//! - a watchdog task that cancels the session when its budget runs out
//!
//! Cancellation is cooperative. Each outstanding device is asked to stop and
//! drops its channel; the session is declared `Canceled` once every device
//! acknowledged or its acknowledgement timed out.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use fix_detect::{
    CandidatePort, DetectionContext, DetectionObserver, DetectionOutcome, Device, ProfileStore,
    ProtocolSniffer, TransportEnumerator,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::LocatorConfig;
use crate::error::LocatorError;
use crate::events::{DetectionEvent, DetectionStatus, SessionPhase};
use crate::ranking::ConfirmedDeviceSet;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct Session {
    id: u64,
    phase: SessionPhase,
    cancel_requested: bool,
    deadline: Option<Instant>,
}

struct LocatorState {
    session: Session,
    known: Vec<Arc<Device>>,
    confirmed: ConfirmedDeviceSet,
    outstanding: Vec<Arc<Device>>,
}

impl LocatorState {
    fn is_known(&self, address: &str) -> bool {
        self.known.iter().any(|d| d.address() == address)
    }
}

pub(crate) struct LocatorInner {
    this: Weak<LocatorInner>,
    config: LocatorConfig,
    enumerators: Vec<Arc<dyn TransportEnumerator>>,
    store: Arc<dyn ProfileStore>,
    sniffer: Arc<ProtocolSniffer>,
    state: Mutex<LocatorState>,
    status: watch::Sender<DetectionStatus>,
    events: broadcast::Sender<DetectionEvent>,
}

/// Finds, ranks and hands out location devices
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct Locator {
    pub(crate) inner: Arc<LocatorInner>,
}

impl Locator {
    /// Create a locator over `enumerators`, persisting profiles in `store`
    pub fn new(
        config: LocatorConfig,
        enumerators: Vec<Arc<dyn TransportEnumerator>>,
        store: Arc<dyn ProfileStore>,
    ) -> Result<Self, LocatorError> {
        config.validate()?;

        let sniffer = Arc::new(ProtocolSniffer::with_config(config.sniffer.clone()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new_cyclic(|this| LocatorInner {
            this: this.clone(),
            config,
            enumerators,
            store,
            sniffer,
            state: Mutex::new(LocatorState {
                session: Session {
                    id: 0,
                    phase: SessionPhase::Idle,
                    cancel_requested: false,
                    deadline: None,
                },
                known: Vec::new(),
                confirmed: ConfirmedDeviceSet::new(),
                outstanding: Vec::new(),
            }),
            status: watch::channel(DetectionStatus::default()).0,
            events,
        });

        Ok(Self { inner })
    }

    /// Active configuration
    pub fn config(&self) -> &LocatorConfig {
        &self.inner.config
    }

    /// Subscribe to detection events
    pub fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.inner.events.subscribe()
    }

    /// Watch the locator status
    pub fn status(&self) -> watch::Receiver<DetectionStatus> {
        self.inner.status.subscribe()
    }

    /// Current session phase
    pub fn phase(&self) -> SessionPhase {
        self.inner.status.borrow().phase
    }

    /// Whether a session is in progress
    pub fn is_detecting(&self) -> bool {
        self.phase().is_active()
    }

    /// Devices the locator knows about, in discovery order
    pub fn known_devices(&self) -> Vec<Arc<Device>> {
        self.inner.lock().known.clone()
    }

    /// Confirmed devices, best first
    pub fn confirmed_devices(&self) -> Vec<Arc<Device>> {
        self.inner.lock().confirmed.to_vec()
    }

    /// Best confirmed device
    pub fn best_device(&self) -> Option<Arc<Device>> {
        self.inner.lock().confirmed.first().cloned()
    }

    /// Start a detection session in the background
    ///
    /// Returns `false` if a session is already running. Must be called from
    /// within a tokio runtime.
    pub fn begin_detection(&self) -> bool {
        let id = {
            let mut state = self.inner.lock();
            if state.session.phase.is_active() {
                debug!("Detection session {} already running", state.session.id);
                return false;
            }

            state.session = Session {
                id: state.session.id + 1,
                phase: SessionPhase::Starting,
                cancel_requested: false,
                deadline: Some(Instant::now() + self.inner.config.detection_timeout),
            };
            state.outstanding.clear();
            self.inner.publish(&state);
            state.session.id
        };

        info!("Detection session {} started", id);
        self.inner.emit(DetectionEvent::DetectionStarted { session: id });

        tokio::spawn(Arc::clone(&self.inner).watchdog(id));
        tokio::spawn(Arc::clone(&self.inner).run_session(id));
        true
    }

    /// Cancel the running session and wait for its devices to stop
    ///
    /// Returns `false` if no session was running or it is already being
    /// canceled.
    pub async fn cancel_detection(&self) -> bool {
        let request = {
            let mut state = self.inner.lock();
            self.inner.request_cancel(&mut state)
        };
        match request {
            Some((id, devices)) => {
                self.inner.complete_cancel(id, devices).await;
                true
            }
            None => false,
        }
    }

    /// Wait until a device is confirmed, the session ends, or `wait` elapses
    ///
    /// Returns whether a confirmed device exists.
    pub async fn wait_for_device(&self, wait: Duration) -> bool {
        let mut status = self.status();
        if status.borrow().confirmed > 0 {
            return true;
        }

        let _ = timeout(
            wait,
            status.wait_for(|s| s.confirmed > 0 || !s.phase.is_active()),
        )
        .await;
        !self.inner.lock().confirmed.is_empty()
    }

    /// Wait until the session ends or `wait` elapses
    ///
    /// Returns whether no session is in progress. With no session running
    /// this returns `true` at once.
    pub async fn wait_for_detection(&self, wait: Duration) -> bool {
        let mut status = self.status();
        if !status.borrow().phase.is_active() {
            return true;
        }
        let ended = timeout(wait, status.wait_for(|s| !s.phase.is_active()))
            .await
            .is_ok();
        ended
    }

    /// Add `device` to the confirmed set unless it is already there
    ///
    /// Under the only-first policy, a device is refused once another one is
    /// confirmed, and the first confirmation cancels the session.
    pub fn register_confirmed(&self, device: &Arc<Device>) -> bool {
        self.inner.register_confirmed(device)
    }

    /// Clear the confirmed set and every device's history
    ///
    /// A running session keeps running.
    pub fn undetect(&self) {
        let devices = {
            let mut state = self.inner.lock();
            state.confirmed.clear();
            self.inner.publish(&state);
            state.known.clone()
        };
        for device in devices {
            device.undetect();
        }
        info!("Detection results cleared");
    }

    /// Forget history and drop every known device
    pub fn forget_known_devices(&self) {
        self.undetect();
        let mut state = self.inner.lock();
        let count = state.known.len();
        state.known.clear();
        self.inner.publish(&state);
        info!("Forgot {} known device(s)", count);
    }
}

impl LocatorInner {
    fn lock(&self) -> MutexGuard<'_, LocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a status snapshot; called with the state lock held
    fn publish(&self, state: &LocatorState) {
        self.status.send_replace(DetectionStatus {
            session: state.session.id,
            phase: state.session.phase,
            canceling: state.session.cancel_requested && state.session.phase.is_active(),
            confirmed: state.confirmed.len(),
            known: state.known.len(),
        });
    }

    fn emit(&self, event: DetectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn context(self: &Arc<Self>) -> DetectionContext {
        DetectionContext {
            policy: self.config.policy(),
            sniffer: Arc::clone(&self.sniffer),
            observer: Arc::clone(self) as Arc<dyn DetectionObserver>,
        }
    }

    /// Whether session `id` is over or being canceled
    fn is_stopping(&self, state: &LocatorState, id: u64) -> bool {
        state.session.id != id || state.session.cancel_requested || !state.session.phase.is_active()
    }

    /// Resolves once session `id` is over or being canceled
    async fn stopping(&self, id: u64) {
        let mut status = self.status.subscribe();
        let _ = status
            .wait_for(|s| s.session != id || s.canceling || !s.phase.is_active())
            .await;
    }

    /// Resolves once session `id` is no longer active
    async fn ended(&self, id: u64) {
        let mut status = self.status.subscribe();
        let _ = status
            .wait_for(|s| s.session != id || !s.phase.is_active())
            .await;
    }

    /// Mark the session as canceling; returns what must be waited on
    fn request_cancel(&self, state: &mut LocatorState) -> Option<(u64, Vec<Arc<Device>>)> {
        if !state.session.phase.is_active() || state.session.cancel_requested {
            return None;
        }
        state.session.cancel_requested = true;
        self.publish(state);
        info!("Canceling detection session {}", state.session.id);
        Some((state.session.id, state.outstanding.clone()))
    }

    async fn complete_cancel(&self, id: u64, devices: Vec<Arc<Device>>) {
        let ack_timeout = self.config.cancellation_timeout;
        let mut acks = JoinSet::new();
        for device in devices {
            acks.spawn(async move {
                let acked = device.cancel_detection(ack_timeout).await;
                (device, acked)
            });
        }

        while let Some(result) = acks.join_next().await {
            match result {
                Ok((device, false)) => warn!(
                    "{} did not acknowledge cancellation within {:?}",
                    device.address(),
                    ack_timeout
                ),
                Ok(_) => {}
                Err(e) => warn!("Cancellation task failed: {}", e),
            }
        }

        {
            let mut state = self.lock();
            if state.session.id == id {
                state.session.phase = SessionPhase::Canceled;
                self.publish(&state);
            }
        }
        info!("Detection session {} canceled", id);
        self.emit(DetectionEvent::DetectionCanceled { session: id });
    }

    fn register_confirmed(&self, device: &Arc<Device>) -> bool {
        let only_first = self.config.only_first_device_detected;
        let (inserted, cancel) = {
            let mut state = self.lock();
            if only_first
                && !state.confirmed.is_empty()
                && !state.confirmed.contains(device.address())
            {
                debug!(
                    "{}: confirmed after the first device, ignoring",
                    device.address()
                );
                return false;
            }

            let inserted = state.confirmed.insert(Arc::clone(device));
            let cancel = if only_first && inserted {
                self.request_cancel(&mut state)
            } else {
                None
            };
            self.publish(&state);
            (inserted, cancel)
        };

        if inserted {
            info!("Confirmed location device on {}", device.address());
            self.emit(DetectionEvent::DeviceConfirmed {
                address: device.address().to_string(),
                baud_rate: device.profile().last_success_baud,
            });
        }

        if let Some((id, devices)) = cancel {
            if let Some(inner) = self.this.upgrade() {
                tokio::spawn(async move { inner.complete_cancel(id, devices).await });
            }
        }
        inserted
    }

    /// Gather candidates from every transport; failures are logged and skipped
    fn enumerate(&self) -> Vec<CandidatePort> {
        let mut candidates = Vec::new();
        for enumerator in &self.enumerators {
            match enumerator.list_candidates() {
                Ok(found) => {
                    debug!("{}: {} candidate(s)", enumerator.name(), found.len());
                    candidates.extend(found);
                }
                Err(e) => warn!("{} enumeration failed: {}", enumerator.name(), e),
            }
        }
        candidates
    }

    /// Add candidates not yet known; returns the new devices
    fn merge(&self, candidates: Vec<CandidatePort>) -> Vec<Arc<Device>> {
        let mut added = Vec::new();
        for candidate in candidates {
            if self.lock().is_known(&candidate.address) {
                continue;
            }

            // Profile store I/O happens outside the lock
            let device = Device::new(candidate, Arc::clone(&self.store));

            let mut state = self.lock();
            if state.is_known(device.address()) {
                continue;
            }
            state.known.push(Arc::clone(&device));
            self.publish(&state);
            drop(state);

            debug!("Discovered {} ({})", device.address(), device.kind());
            self.emit(DetectionEvent::DeviceDiscovered {
                address: device.address().to_string(),
                kind: device.kind(),
                friendly_name: device.friendly_name(),
            });
            added.push(device);
        }
        added
    }

    /// Start detection on `device` as part of session `id`
    fn launch(self: &Arc<Self>, id: u64, device: &Arc<Device>) -> bool {
        let policy = self.config.policy();
        if let Some(reason) = device.exclusion(&policy) {
            debug!("{}: not probed ({})", device.address(), reason);
            return false;
        }
        // Sniffing takes over the channel; a held connection stays with its owner
        if device.is_open() {
            debug!("{}: connection in use, not probed", device.address());
            return false;
        }

        let mut state = self.lock();
        if self.is_stopping(&state, id) {
            return false;
        }
        if !device.begin_detection(self.context()) {
            return false;
        }
        state.outstanding.push(Arc::clone(device));
        true
    }

    async fn run_session(self: Arc<Self>, id: u64) {
        let candidates = self.enumerate();
        self.merge(candidates);

        if self.config.allow_exhaustive_serial_scan && self.config.allow_serial {
            let count = self.config.exhaustive_port_count();
            let extra: Vec<_> = self
                .enumerators
                .iter()
                .flat_map(|e| e.exhaustive_candidates(count))
                .collect();
            let added = self.merge(extra);
            debug!("Exhaustive scan added {} port(s)", added.len());
        }

        let known = {
            let mut state = self.lock();
            if self.is_stopping(&state, id) {
                return;
            }
            state.session.phase = SessionPhase::Running;
            self.publish(&state);
            state.known.clone()
        };

        let (wireless, wired): (Vec<_>, Vec<_>) =
            known.into_iter().partition(|d| d.kind().is_wireless());

        let launched: Vec<_> = wired.iter().filter(|d| self.launch(id, d)).collect();
        info!("Session {}: probing {} wired device(s)", id, launched.len());

        // Some platforms serialize wireless I/O behind wired opens
        for device in launched {
            tokio::select! {
                _ = device.opening_finished() => {}
                _ = self.stopping(id) => return,
            }
        }

        let launched = wireless.iter().filter(|d| self.launch(id, d)).count();
        if launched > 0 {
            info!("Session {}: probing {} wireless device(s)", id, launched);
        }

        self.drain_discovery(id).await;

        let outstanding = self.lock().outstanding.clone();
        tokio::select! {
            _ = async {
                for device in &outstanding {
                    device.detection_finished().await;
                }
            } => {}
            _ = self.stopping(id) => return,
        }

        let confirmed = {
            let mut state = self.lock();
            if self.is_stopping(&state, id) {
                return;
            }
            state.session.phase = SessionPhase::Completed;
            self.publish(&state);
            state.confirmed.len()
        };
        info!(
            "Detection session {} completed with {} confirmed device(s)",
            id, confirmed
        );
        self.emit(DetectionEvent::DetectionCompleted {
            session: id,
            confirmed,
        });
    }

    /// Merge and probe devices reported by discovery streams until they close
    async fn drain_discovery(self: &Arc<Self>, id: u64) {
        let (tx, mut rx) = mpsc::channel(32);
        for enumerator in &self.enumerators {
            if let Some(mut stream) = enumerator.start_discovery() {
                debug!("{}: discovery started", enumerator.name());
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Some(candidate) = stream.recv().await {
                        if tx.send(candidate).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }
        drop(tx);

        loop {
            tokio::select! {
                candidate = rx.recv() => match candidate {
                    Some(candidate) => {
                        for device in self.merge(vec![candidate]) {
                            self.launch(id, &device);
                        }
                    }
                    None => break,
                },
                _ = self.stopping(id) => break,
            }
        }
    }

    /// Cancel session `id` if it outlives its deadline
    async fn watchdog(self: Arc<Self>, id: u64) {
        let Some(deadline) = self.lock().session.deadline else {
            return;
        };

        tokio::select! {
            _ = sleep_until(deadline) => {}
            _ = self.ended(id) => return,
        }

        let request = {
            let mut state = self.lock();
            if state.session.id != id {
                return;
            }
            self.request_cancel(&mut state)
        };
        if let Some((id, devices)) = request {
            warn!(
                "Detection session {} exceeded {:?}, canceling",
                id, self.config.detection_timeout
            );
            self.complete_cancel(id, devices).await;
        }
    }
}

impl DetectionObserver for LocatorInner {
    fn attempt_started(&self, device: &Arc<Device>) {
        self.emit(DetectionEvent::AttemptStarted {
            address: device.address().to_string(),
        });
    }

    fn attempt_finished(&self, device: &Arc<Device>, outcome: &DetectionOutcome) {
        match outcome {
            DetectionOutcome::Confirmed { .. } => {
                self.register_confirmed(device);
            }
            DetectionOutcome::Excluded { reason } => {
                debug!("{}: excluded ({})", device.address(), reason);
            }
            _ => {
                let Some(cause) = outcome.failure_cause(device.address()) else {
                    debug!("{}: attempt canceled", device.address());
                    return;
                };

                {
                    let mut state = self.lock();
                    if state.confirmed.remove(device.address()) {
                        self.publish(&state);
                    }
                }
                info!("{}: {}", device.address(), cause);
                self.emit(DetectionEvent::AttemptFailed {
                    address: device.address().to_string(),
                    cause,
                });
            }
        }
    }
}
