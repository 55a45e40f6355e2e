//! Integration tests for the locator
//!
//! These tests verify end-to-end behavior against simulated transports:
//! - Session lifecycle, watchdog and cooperative cancellation
//! - Ranking and the only-first-device policy
//! - Exhaustive scan deduplication
//! - Connection acquisition and error propagation

use std::sync::Arc;
use std::time::Duration;

use fix_detect::{
    DetectError, DeviceKind, MemoryProfileStore, ProfileStore, ReliabilityProfile,
    TransportEnumerator,
};
use fix_locator::{DetectionEvent, Locator, LocatorConfig, LocatorError, SessionPhase};
use fix_sim::{SimBehavior, SimulatedBus, SimulatedTransport};
use tokio::sync::broadcast;
use tokio::time::Instant;

// ============================================================================
// Helper Functions
// ============================================================================

mod helpers {
    use super::*;

    pub const LONG: Duration = Duration::from_secs(3600);

    pub fn locator(
        config: LocatorConfig,
        transports: Vec<SimulatedTransport>,
        store: Arc<dyn ProfileStore>,
    ) -> Locator {
        let enumerators = transports
            .into_iter()
            .map(|t| Arc::new(t) as Arc<dyn TransportEnumerator>)
            .collect();
        Locator::new(config, enumerators, store).unwrap()
    }

    /// A serial transport listing `ports`, each attached to the bus
    pub fn serial(bus: &Arc<SimulatedBus>, ports: &[(&str, SimBehavior)]) -> SimulatedTransport {
        let mut transport = SimulatedTransport::serial(Arc::clone(bus));
        for (address, behavior) in ports {
            bus.attach(*address, behavior.clone());
            transport = transport.with_port(*address, *address);
        }
        transport
    }

    pub fn gps(native_baud: u32) -> SimBehavior {
        SimBehavior::Gps { native_baud }
    }

    pub fn drain(rx: &mut broadcast::Receiver<DetectionEvent>) -> Vec<DetectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn addresses(locator: &Locator) -> Vec<String> {
        locator
            .confirmed_devices()
            .iter()
            .map(|d| d.address().to_string())
            .collect()
    }

    pub async fn wait_for_attempt(rx: &mut broadcast::Receiver<DetectionEvent>, address: &str) {
        loop {
            match rx.recv().await {
                Ok(DetectionEvent::AttemptStarted { address: a }) if a == address => return,
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    }
}

use helpers::*;

// ============================================================================
// Session Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_finds_receiver_among_other_ports() {
    let bus = SimulatedBus::new();
    let transport = serial(
        &bus,
        &[
            ("COM1", SimBehavior::AsciiChatter),
            ("COM2", SimBehavior::Silent),
            ("COM3", gps(9_600)),
        ],
    );
    let locator = locator(
        LocatorConfig::default(),
        vec![transport],
        Arc::new(MemoryProfileStore::new()),
    );
    let mut events = locator.subscribe();

    assert!(locator.begin_detection());
    assert!(locator.wait_for_detection(LONG).await);
    assert_eq!(locator.phase(), SessionPhase::Completed);
    assert_eq!(addresses(&locator), vec!["COM3"]);

    let events = drain(&mut events);
    assert_eq!(events[0], DetectionEvent::DetectionStarted { session: 1 });
    assert!(events.contains(&DetectionEvent::DeviceConfirmed {
        address: "COM3".into(),
        baud_rate: Some(9_600),
    }));
    for address in ["COM1", "COM2"] {
        assert!(events.contains(&DetectionEvent::AttemptFailed {
            address: address.into(),
            cause: DetectError::ProtocolMismatch {
                device: address.into()
            },
        }));
    }
    assert_eq!(
        events.last(),
        Some(&DetectionEvent::DetectionCompleted {
            session: 1,
            confirmed: 1
        })
    );

    let status = *locator.status().borrow();
    assert_eq!(status.session, 1);
    assert_eq!(status.known, 3);
    assert_eq!(status.confirmed, 1);
    assert!(!status.canceling);
}

#[tokio::test(start_paused = true)]
async fn test_begin_is_idempotent_while_running() {
    let bus = SimulatedBus::new();
    let transport = serial(&bus, &[("COM2", SimBehavior::Silent)]);
    let locator = locator(
        LocatorConfig::default(),
        vec![transport],
        Arc::new(MemoryProfileStore::new()),
    );

    assert!(locator.begin_detection());
    assert!(!locator.begin_detection());
    assert!(locator.is_detecting());

    assert!(locator.wait_for_detection(LONG).await);
    assert!(locator.begin_detection());
    assert_eq!(locator.status().borrow().session, 2);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_detection_when_idle() {
    let locator = locator(
        LocatorConfig::default(),
        Vec::new(),
        Arc::new(MemoryProfileStore::new()),
    );
    assert!(locator.wait_for_detection(Duration::from_secs(1)).await);
    assert_eq!(locator.phase(), SessionPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_detection_times_out_while_running() {
    let bus = SimulatedBus::new();
    let transport = serial(&bus, &[("COM2", SimBehavior::Silent)]);
    let locator = locator(
        LocatorConfig::default(),
        vec![transport],
        Arc::new(MemoryProfileStore::new()),
    );

    assert!(locator.begin_detection());
    let start = Instant::now();
    assert!(!locator.wait_for_detection(Duration::from_secs(2)).await);
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(start.elapsed() <= Duration::from_secs(2) + Duration::from_millis(5));
    assert!(locator.is_detecting());

    // Six silent rates at one second each
    assert!(locator.wait_for_detection(LONG).await);
    assert_eq!(locator.phase(), SessionPhase::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_wireless_devices_found_through_discovery() {
    let bus = SimulatedBus::new();
    let wired = serial(&bus, &[("COM3", gps(9_600))]);
    bus.attach("BT:00:1B:DC", gps(4_800));
    let wireless =
        SimulatedTransport::bluetooth(Arc::clone(&bus)).with_discovered("BT:00:1B:DC", "GLO");

    let locator = locator(
        LocatorConfig::default(),
        vec![wired, wireless],
        Arc::new(MemoryProfileStore::new()),
    );
    let mut events = locator.subscribe();

    locator.begin_detection();
    assert!(locator.wait_for_detection(LONG).await);

    let known: Vec<_> = locator
        .known_devices()
        .iter()
        .map(|d| (d.address().to_string(), d.kind()))
        .collect();
    assert_eq!(
        known,
        vec![
            ("COM3".to_string(), DeviceKind::Serial),
            ("BT:00:1B:DC".to_string(), DeviceKind::Bluetooth)
        ]
    );
    assert_eq!(locator.confirmed_devices().len(), 2);
    assert!(drain(&mut events).contains(&DetectionEvent::DeviceDiscovered {
        address: "BT:00:1B:DC".into(),
        kind: DeviceKind::Bluetooth,
        friendly_name: "GLO".into(),
    }));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_category_is_not_probed() {
    let bus = SimulatedBus::new();
    let transport = serial(&bus, &[("COM3", gps(4_800))]);
    let config = LocatorConfig {
        allow_serial: false,
        ..Default::default()
    };
    let locator = locator(config, vec![transport], Arc::new(MemoryProfileStore::new()));

    assert_eq!(locator.acquire_connection().await.err(), Some(LocatorError::NotFound));
    assert!(!bus.touched("COM3"));
    assert_eq!(locator.phase(), SessionPhase::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_enumeration_failure_does_not_stop_session() {
    let bus = SimulatedBus::new();
    let broken = SimulatedTransport::bluetooth(Arc::clone(&bus)).failing();
    let working = serial(&bus, &[("COM3", gps(4_800))]);
    let locator = locator(
        LocatorConfig::default(),
        vec![broken, working],
        Arc::new(MemoryProfileStore::new()),
    );

    locator.begin_detection();
    assert!(locator.wait_for_detection(LONG).await);
    assert_eq!(addresses(&locator), vec!["COM3"]);
}

// ============================================================================
// Waiting and Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_wait_for_device_respects_timeout() {
    let bus = SimulatedBus::new();
    let transport = serial(&bus, &[("COM2", SimBehavior::Silent)]);
    let locator = locator(
        LocatorConfig::default(),
        vec![transport],
        Arc::new(MemoryProfileStore::new()),
    );

    locator.begin_detection();
    let start = Instant::now();
    assert!(!locator.wait_for_device(Duration::from_secs(2)).await);
    assert!(start.elapsed() <= Duration::from_secs(2) + Duration::from_millis(5));
    assert!(locator.is_detecting());
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_device_returns_at_once_when_confirmed() {
    let bus = SimulatedBus::new();
    let transport = serial(&bus, &[("COM3", gps(4_800))]);
    let locator = locator(
        LocatorConfig::default(),
        vec![transport],
        Arc::new(MemoryProfileStore::new()),
    );

    locator.begin_detection();
    assert!(locator.wait_for_detection(LONG).await);

    let start = Instant::now();
    assert!(locator.wait_for_device(Duration::from_secs(10)).await);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_is_idempotent() {
    let bus = SimulatedBus::new();
    let transport = serial(&bus, &[("COM2", SimBehavior::Silent)]);
    let locator = locator(
        LocatorConfig::default(),
        vec![transport],
        Arc::new(MemoryProfileStore::new()),
    );
    let mut events = locator.subscribe();

    assert!(!locator.cancel_detection().await);

    locator.begin_detection();
    wait_for_attempt(&mut events, "COM2").await;
    assert_eq!(bus.open_links("COM2"), 1);

    assert!(locator.cancel_detection().await);
    assert!(!locator.cancel_detection().await);
    assert_eq!(locator.phase(), SessionPhase::Canceled);
    assert_eq!(bus.open_links("COM2"), 0);
    assert!(locator.wait_for_detection(Duration::ZERO).await);

    let canceled = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, DetectionEvent::DetectionCanceled { .. }))
        .count();
    assert_eq!(canceled, 1);

    // A canceled attempt is not a failure
    let known = locator.known_devices();
    assert_eq!(known[0].profile().fail_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_cancels_overdue_session() {
    let bus = SimulatedBus::new();
    let transport = serial(&bus, &[("COM2", SimBehavior::Silent)]);
    let config = LocatorConfig {
        detection_timeout: Duration::from_secs(3),
        ..Default::default()
    };
    let locator = locator(config, vec![transport], Arc::new(MemoryProfileStore::new()));

    let start = Instant::now();
    locator.begin_detection();
    assert!(locator.wait_for_detection(LONG).await);

    assert_eq!(locator.phase(), SessionPhase::Canceled);
    assert!(start.elapsed() >= Duration::from_secs(3));
    assert!(start.elapsed() < Duration::from_secs(6));
    assert_eq!(bus.open_links("COM2"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_only_first_device_policy() {
    let bus = SimulatedBus::new();
    let transport = serial(
        &bus,
        &[
            ("COM3", gps(115_200)),
            ("COM4", SimBehavior::Silent),
            ("COM5", gps(4_800)),
        ],
    );
    let config = LocatorConfig {
        only_first_device_detected: true,
        ..Default::default()
    };
    let locator = locator(config, vec![transport], Arc::new(MemoryProfileStore::new()));

    locator.begin_detection();
    assert!(locator.wait_for_detection(LONG).await);

    assert_eq!(locator.phase(), SessionPhase::Canceled);
    assert_eq!(locator.confirmed_devices().len(), 1);
    assert_eq!(bus.open_links("COM4"), 0);
}

// ============================================================================
// Known Devices and Ranking
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_exhaustive_scan_skips_known_ports() {
    let bus = SimulatedBus::new();
    bus.attach("COM0", SimBehavior::Noise);
    let transport =
        serial(&bus, &[("COM1", SimBehavior::AsciiChatter)]).with_exhaustive_prefix("COM");
    let config = LocatorConfig {
        allow_exhaustive_serial_scan: true,
        max_serial_port_number: 3,
        ..Default::default()
    };
    let locator = locator(config, vec![transport], Arc::new(MemoryProfileStore::new()));

    locator.begin_detection();
    assert!(locator.wait_for_detection(LONG).await);

    assert_eq!(bus.open_count("COM1"), 1);
    assert_eq!(bus.open_count("COM0"), 1);
    assert_eq!(bus.open_count("COM2"), 1);
    assert!(!bus.touched("COM3"));

    let known: Vec<_> = locator
        .known_devices()
        .iter()
        .map(|d| d.address().to_string())
        .collect();
    assert_eq!(known, vec!["COM1", "COM0", "COM2"]);
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_devices_ranked_by_history() {
    let mut weak = ReliabilityProfile::new("COM3");
    weak.success_count = 1;
    weak.fail_count = 5;
    let mut strong = ReliabilityProfile::new("COM4");
    strong.success_count = 10;
    let store = Arc::new(MemoryProfileStore::with_profiles([
        ("COM3".to_string(), weak),
        ("COM4".to_string(), strong),
    ]));

    let bus = SimulatedBus::new();
    let transport = serial(&bus, &[("COM3", gps(4_800)), ("COM4", gps(4_800))]);
    let locator = locator(LocatorConfig::default(), vec![transport], store);

    locator.begin_detection();
    assert!(locator.wait_for_detection(LONG).await);
    assert_eq!(addresses(&locator), vec!["COM4", "COM3"]);

    let device = locator.acquire_connection().await.unwrap();
    assert_eq!(device.address(), "COM4");
    assert!(device.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_failed_reprobe_leaves_confirmed_set() {
    let bus = SimulatedBus::new();
    let transport = serial(&bus, &[("COM3", gps(4_800))]);
    let locator = locator(
        LocatorConfig::default(),
        vec![transport],
        Arc::new(MemoryProfileStore::new()),
    );

    locator.begin_detection();
    assert!(locator.wait_for_detection(LONG).await);
    assert_eq!(addresses(&locator), vec!["COM3"]);

    bus.attach("COM3", SimBehavior::Noise);
    locator.begin_detection();
    assert!(locator.wait_for_detection(LONG).await);
    assert!(locator.confirmed_devices().is_empty());
    assert_eq!(locator.known_devices()[0].profile().fail_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_undetect_and_forget() {
    let bus = SimulatedBus::new();
    let transport = serial(&bus, &[("COM3", gps(4_800))]);
    let store = Arc::new(MemoryProfileStore::new());
    let locator = locator(LocatorConfig::default(), vec![transport], store.clone());

    locator.begin_detection();
    assert!(locator.wait_for_detection(LONG).await);
    assert_eq!(store.read("COM3").unwrap().unwrap().success_count, 1);

    locator.undetect();
    assert!(locator.confirmed_devices().is_empty());
    assert_eq!(locator.known_devices().len(), 1);
    assert!(store.read("COM3").unwrap().is_none());

    locator.forget_known_devices();
    assert!(locator.known_devices().is_empty());
    assert_eq!(locator.status().borrow().known, 0);

    let mut events = locator.subscribe();
    locator.begin_detection();
    assert!(locator.wait_for_detection(LONG).await);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, DetectionEvent::DeviceDiscovered { address, .. } if address == "COM3")));
}

// ============================================================================
// Connection Acquisition
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_acquire_detects_then_reuses_connection() {
    let bus = SimulatedBus::new();
    let transport = serial(&bus, &[("COM2", SimBehavior::Silent), ("COM3", gps(38_400))]);
    let locator = locator(
        LocatorConfig::default(),
        vec![transport],
        Arc::new(MemoryProfileStore::new()),
    );

    let device = locator.acquire_connection().await.unwrap();
    assert_eq!(device.address(), "COM3");
    assert_eq!(device.connection_baud(), Some(38_400));

    let again = locator.acquire_connection().await.unwrap();
    assert!(Arc::ptr_eq(&device, &again));
    assert_eq!(bus.open_links("COM3"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_new_session_leaves_held_connection_open() {
    let bus = SimulatedBus::new();
    let transport = serial(&bus, &[("COM2", SimBehavior::Silent), ("COM3", gps(9_600))]);
    let locator = locator(
        LocatorConfig::default(),
        vec![transport],
        Arc::new(MemoryProfileStore::new()),
    );

    let device = locator.acquire_connection().await.unwrap();
    assert!(locator.wait_for_detection(LONG).await);
    let opens = bus.open_count("COM3");

    let mut rx = locator.subscribe();
    assert!(locator.begin_detection());
    assert!(locator.wait_for_detection(LONG).await);
    assert_eq!(locator.phase(), SessionPhase::Completed);

    assert!(device.is_open());
    assert_eq!(bus.open_links("COM3"), 1);
    assert_eq!(bus.open_count("COM3"), opens);
    assert_eq!(addresses(&locator), vec!["COM3"]);

    let events = drain(&mut rx);
    assert!(!events.contains(&DetectionEvent::AttemptStarted {
        address: "COM3".into()
    }));
    assert!(events.contains(&DetectionEvent::AttemptStarted {
        address: "COM2".into()
    }));

    let again = locator.acquire_connection().await.unwrap();
    assert!(Arc::ptr_eq(&device, &again));
}

#[tokio::test(start_paused = true)]
async fn test_acquire_with_nothing_attached() {
    let locator = locator(
        LocatorConfig::default(),
        vec![SimulatedTransport::serial(SimulatedBus::new())],
        Arc::new(MemoryProfileStore::new()),
    );
    assert_eq!(locator.acquire_connection().await.err(), Some(LocatorError::NotFound));
}

#[tokio::test(start_paused = true)]
async fn test_acquire_propagates_transport_error() {
    let bus = SimulatedBus::new();
    let transport = serial(&bus, &[("COM3", gps(4_800))]);
    let locator = locator(
        LocatorConfig::default(),
        vec![transport],
        Arc::new(MemoryProfileStore::new()),
    );

    let device = locator.acquire_connection().await.unwrap();
    assert!(locator.wait_for_detection(LONG).await);
    assert!(device.close());

    bus.attach(
        "COM3",
        SimBehavior::OpenFails {
            permission_denied: true,
        },
    );
    let err = locator.acquire_connection().await.err().unwrap();
    assert!(matches!(
        err,
        LocatorError::Transport(DetectError::PermissionDenied { .. })
    ));
    assert!(locator.confirmed_devices().is_empty());
}

#[test]
fn test_invalid_config_rejected() {
    let config = LocatorConfig {
        max_serial_port_number: 101,
        ..Default::default()
    };
    let result = Locator::new(config, Vec::new(), Arc::new(MemoryProfileStore::new()));
    assert!(matches!(result, Err(LocatorError::Config(_))));
}
