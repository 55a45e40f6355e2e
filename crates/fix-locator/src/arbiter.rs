//! Connection acquisition
//!
//! [`Locator::acquire_connection`] hands out one open device, detecting first
//! if nothing is confirmed and re-detecting once if every confirmed device
//! refuses to open.

use std::sync::Arc;

use fix_detect::{DetectError, Device};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::LocatorError;
use crate::orchestrator::Locator;

impl Locator {
    /// Return an open connection to the best available device
    ///
    /// Fails with the last transport-level error seen when devices exist but
    /// none could be opened, and with [`LocatorError::NotFound`] otherwise.
    pub async fn acquire_connection(&self) -> Result<Arc<Device>, LocatorError> {
        if self.confirmed_devices().is_empty() {
            self.begin_detection();
            if !self.wait_for_device(self.config().device_wait_timeout).await {
                info!("No location device found");
                return Err(LocatorError::NotFound);
            }
        }

        let confirmed = self.confirmed_devices();
        if let Some(device) = confirmed.iter().find(|d| d.is_open()) {
            debug!("Reusing open connection on {}", device.address());
            return Ok(Arc::clone(device));
        }

        let mut last_error = None;
        if let Some(device) = self.connect_pass(&confirmed, &mut last_error).await {
            return Ok(device);
        }

        info!("No confirmed device could be opened, detecting again");
        self.begin_detection();
        self.wait_for_detection(self.config().detection_timeout).await;

        let confirmed = self.confirmed_devices();
        if let Some(device) = self.connect_pass(&confirmed, &mut last_error).await {
            return Ok(device);
        }

        match last_error {
            Some(e) => Err(LocatorError::Transport(e)),
            None => Err(LocatorError::NotFound),
        }
    }

    /// Open the first device that allows it, best first
    async fn connect_pass(
        &self,
        devices: &[Arc<Device>],
        last_error: &mut Option<DetectError>,
    ) -> Option<Arc<Device>> {
        for device in devices.iter().filter(|d| d.allows_connections()) {
            // A device reports its outcome just before leaving detection
            let _ = timeout(
                self.config().cancellation_timeout,
                device.detection_finished(),
            )
            .await;

            match device.open() {
                Ok(()) => {
                    info!("Connected to {}", device.address());
                    return Some(Arc::clone(device));
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", device.address(), e);
                    if e.is_transport_level() {
                        *last_error = Some(e);
                    }
                }
            }
        }
        None
    }
}
