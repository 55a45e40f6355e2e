//! Ready-made device layouts

use std::sync::Arc;

use fix_detect::TransportEnumerator;

use crate::link::SimBehavior;
use crate::transport::{SimulatedBus, SimulatedTransport};

/// A bus plus the transports that enumerate it
pub struct Scenario {
    /// Bus all transports open through
    pub bus: Arc<SimulatedBus>,
    /// Transports to hand to a locator
    pub transports: Vec<Arc<dyn TransportEnumerator>>,
}

impl Scenario {
    /// A desk with a modem, a dead port, a USB receiver and a paired
    /// Bluetooth receiver that shows up during discovery
    pub fn demo() -> Self {
        let bus = SimulatedBus::new();
        bus.attach("COM1", SimBehavior::AsciiChatter);
        bus.attach("COM2", SimBehavior::Silent);
        bus.attach("COM3", SimBehavior::Gps { native_baud: 9_600 });
        bus.attach("BT:00:1B:DC:0F:33:21", SimBehavior::Gps { native_baud: 4_800 });

        let serial = SimulatedTransport::serial(Arc::clone(&bus))
            .with_port("COM1", "Communications Port")
            .with_port("COM2", "Printer Port")
            .with_port("COM3", "u-blox 7 GPS/GNSS Receiver")
            .with_exhaustive_prefix("COM");
        let bluetooth = SimulatedTransport::bluetooth(Arc::clone(&bus))
            .with_discovered("BT:00:1B:DC:0F:33:21", "Garmin GLO");

        Self {
            bus,
            transports: vec![Arc::new(serial), Arc::new(bluetooth)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_layout() {
        let scenario = Scenario::demo();
        assert_eq!(scenario.transports.len(), 2);
        let listed = scenario.transports[0].list_candidates().unwrap();
        assert_eq!(listed.len(), 3);
        assert!(scenario.transports[1].start_discovery().is_some());
    }
}
