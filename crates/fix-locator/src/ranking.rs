//! Ranking of confirmed devices
//!
//! Devices are ordered best-first by:
//!
//! 1. higher success ratio, with devices that were never tried ranked last
//! 2. more recent confirmation
//! 3. fewer failures
//!
//! Remaining ties keep insertion order.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::SystemTime;

use fix_detect::{Device, ReliabilityProfile};

/// The fields of a reliability profile that decide rank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankKey {
    /// Confirmed sniffs
    pub success_count: u32,
    /// Failed sniffs
    pub fail_count: u32,
    /// Most recent confirmation
    pub last_detected_at: Option<SystemTime>,
}

impl RankKey {
    /// Extract the ranking fields from a profile
    pub fn from_profile(profile: &ReliabilityProfile) -> Self {
        Self {
            success_count: profile.success_count,
            fail_count: profile.fail_count,
            last_detected_at: profile.last_detected_at,
        }
    }

    fn total(&self) -> u128 {
        self.success_count as u128 + self.fail_count as u128
    }

    /// Order two keys; `Less` means `self` ranks ahead of `other`
    pub fn compare(&self, other: &Self) -> Ordering {
        let by_ratio = match (self.total(), other.total()) {
            (0, 0) => Ordering::Equal,
            (0, _) => Ordering::Greater,
            (_, 0) => Ordering::Less,
            // a/b > c/d  <=>  a*d > c*b
            (mine, theirs) => {
                (other.success_count as u128 * mine).cmp(&(self.success_count as u128 * theirs))
            }
        };

        by_ratio
            .then_with(|| other.last_detected_at.cmp(&self.last_detected_at))
            .then_with(|| self.fail_count.cmp(&other.fail_count))
    }
}

/// Confirmed devices, always sorted best-first
#[derive(Debug, Default)]
pub struct ConfirmedDeviceSet {
    devices: Vec<Arc<Device>>,
}

impl ConfirmedDeviceSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `device` unless a device with its address is present, then re-sort
    ///
    /// Returns whether the device was inserted.
    pub fn insert(&mut self, device: Arc<Device>) -> bool {
        let inserted = !self.contains(device.address());
        if inserted {
            self.devices.push(device);
        }
        self.sort();
        inserted
    }

    /// Remove the device with `address`
    pub fn remove(&mut self, address: &str) -> bool {
        let before = self.devices.len();
        self.devices.retain(|d| d.address() != address);
        self.devices.len() != before
    }

    /// Whether a device with `address` is present
    pub fn contains(&self, address: &str) -> bool {
        self.devices.iter().any(|d| d.address() == address)
    }

    /// Remove every device
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Best-ranked device
    pub fn first(&self) -> Option<&Arc<Device>> {
        self.devices.first()
    }

    /// Devices in rank order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.iter()
    }

    /// Owned copy of the ranked list
    pub fn to_vec(&self) -> Vec<Arc<Device>> {
        self.devices.clone()
    }

    fn sort(&mut self) {
        let mut keyed: Vec<_> = self
            .devices
            .drain(..)
            .map(|d| (RankKey::from_profile(&d.profile()), d))
            .collect();
        keyed.sort_by(|a, b| a.0.compare(&b.0));
        self.devices = keyed.into_iter().map(|(_, d)| d).collect();
    }
}
