//! Reliability profiles and their stores
//!
//! Every device keeps a small history of how detection went for it. The
//! history decides which baud rate is tried first, when a device stops being
//! probed, and how confirmed devices are ranked. Persistence is best-effort:
//! store failures are logged by the caller and never abort detection.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

/// Detection history for one device identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityProfile {
    /// Number of sniffs that confirmed the protocol
    pub success_count: u32,
    /// Number of sniffs that did not
    pub fail_count: u32,
    /// Baud rate of the most recent confirmation
    pub last_success_baud: Option<u32>,
    /// When the protocol was last confirmed
    pub last_detected_at: Option<SystemTime>,
    /// When a connection was last opened
    pub last_connected_at: Option<SystemTime>,
    /// Display name
    #[serde(default)]
    pub friendly_name: String,
}

impl ReliabilityProfile {
    /// Create an empty profile
    pub fn new(friendly_name: impl Into<String>) -> Self {
        Self {
            friendly_name: friendly_name.into(),
            ..Default::default()
        }
    }

    /// Record a confirmed sniff at `baud_rate`
    pub fn record_success(&mut self, baud_rate: u32) {
        self.success_count = self.success_count.saturating_add(1);
        self.last_success_baud = Some(baud_rate);
        self.last_detected_at = Some(SystemTime::now());
    }

    /// Record a failed sniff
    pub fn record_failure(&mut self) {
        self.fail_count = self.fail_count.saturating_add(1);
    }

    /// Record that a connection was opened
    pub fn record_connected(&mut self) {
        self.last_connected_at = Some(SystemTime::now());
    }

    /// Total sniff attempts recorded
    pub fn total_attempts(&self) -> u64 {
        self.success_count as u64 + self.fail_count as u64
    }

    /// Fraction of attempts that succeeded, or `None` when nothing was tried
    pub fn success_ratio(&self) -> Option<f64> {
        match self.total_attempts() {
            0 => None,
            total => Some(self.success_count as f64 / total as f64),
        }
    }

    /// Whether the device never succeeded and has used up its failure budget
    pub fn is_unproductive(&self, max_failures: u32) -> bool {
        self.success_count == 0 && self.fail_count >= max_failures
    }
}

/// Key-value persistence for reliability profiles, keyed by device address
pub trait ProfileStore: Send + Sync {
    /// Read the profile stored for `address`
    fn read(&self, address: &str) -> Result<Option<ReliabilityProfile>, StoreError>;

    /// Store `profile` for `address`, replacing any previous value
    fn write(&self, address: &str, profile: &ReliabilityProfile) -> Result<(), StoreError>;

    /// Remove the profile stored for `address`
    fn delete(&self, address: &str) -> Result<(), StoreError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-local store, useful for tests and one-shot runs
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<HashMap<String, ReliabilityProfile>>,
}

impl MemoryProfileStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with profiles
    pub fn with_profiles(profiles: impl IntoIterator<Item = (String, ReliabilityProfile)>) -> Self {
        Self {
            profiles: Mutex::new(profiles.into_iter().collect()),
        }
    }

    /// Number of stored profiles
    pub fn len(&self) -> usize {
        lock(&self.profiles).len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        lock(&self.profiles).is_empty()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn read(&self, address: &str) -> Result<Option<ReliabilityProfile>, StoreError> {
        Ok(lock(&self.profiles).get(address).cloned())
    }

    fn write(&self, address: &str, profile: &ReliabilityProfile) -> Result<(), StoreError> {
        lock(&self.profiles).insert(address.to_string(), profile.clone());
        Ok(())
    }

    fn delete(&self, address: &str) -> Result<(), StoreError> {
        lock(&self.profiles).remove(address);
        Ok(())
    }
}

/// Store backed by a single JSON document on disk
///
/// The whole document is rewritten on every change through a temporary file
/// and a rename, so a crash never leaves a truncated file behind.
#[derive(Debug)]
pub struct JsonProfileStore {
    path: PathBuf,
    profiles: Mutex<BTreeMap<String, ReliabilityProfile>>,
}

impl JsonProfileStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let profiles = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} profile(s) from {}", profiles.len(), path.display());

        Ok(Self {
            path,
            profiles: Mutex::new(profiles),
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All stored profiles, ordered by address
    pub fn entries(&self) -> Vec<(String, ReliabilityProfile)> {
        lock(&self.profiles)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Remove every stored profile
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut profiles = lock(&self.profiles);
        profiles.clear();
        self.persist(&profiles)
    }

    fn persist(&self, profiles: &BTreeMap<String, ReliabilityProfile>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(profiles)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ProfileStore for JsonProfileStore {
    fn read(&self, address: &str) -> Result<Option<ReliabilityProfile>, StoreError> {
        Ok(lock(&self.profiles).get(address).cloned())
    }

    fn write(&self, address: &str, profile: &ReliabilityProfile) -> Result<(), StoreError> {
        let mut profiles = lock(&self.profiles);
        profiles.insert(address.to_string(), profile.clone());
        self.persist(&profiles)
    }

    fn delete(&self, address: &str) -> Result<(), StoreError> {
        let mut profiles = lock(&self.profiles);
        if profiles.remove(address).is_some() {
            self.persist(&profiles)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_counters() {
        let mut profile = ReliabilityProfile::new("GPS 18x");
        assert_eq!(profile.success_ratio(), None);

        profile.record_failure();
        profile.record_success(4800);
        profile.record_success(9600);

        assert_eq!(profile.success_count, 2);
        assert_eq!(profile.fail_count, 1);
        assert_eq!(profile.last_success_baud, Some(9600));
        assert!(profile.last_detected_at.is_some());
        assert!(profile.last_connected_at.is_none());
        assert_eq!(profile.total_attempts(), 3);
        assert!((profile.success_ratio().unwrap() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unproductive_budget() {
        let mut profile = ReliabilityProfile::new("IR port");
        profile.fail_count = 99;
        assert!(!profile.is_unproductive(100));

        profile.record_failure();
        assert!(profile.is_unproductive(100));

        // A single success keeps the device in rotation forever
        profile.success_count = 1;
        assert!(!profile.is_unproductive(100));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryProfileStore::new();
        assert!(store.read("COM1").unwrap().is_none());

        let profile = ReliabilityProfile::new("COM1");
        store.write("COM1", &profile).unwrap();
        assert_eq!(store.read("COM1").unwrap(), Some(profile));
        assert_eq!(store.len(), 1);

        store.delete("COM1").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("profiles.json");

        let mut profile = ReliabilityProfile::new("u-blox 7");
        profile.record_success(9600);
        {
            let store = JsonProfileStore::open(&path).unwrap();
            store.write("/dev/ttyACM0", &profile).unwrap();
            store
                .write("/dev/ttyS0", &ReliabilityProfile::new("ttyS0"))
                .unwrap();
        }

        let store = JsonProfileStore::open(&path).unwrap();
        assert_eq!(store.read("/dev/ttyACM0").unwrap(), Some(profile));

        let addresses: Vec<_> = store.entries().into_iter().map(|(a, _)| a).collect();
        assert_eq!(addresses, vec!["/dev/ttyACM0", "/dev/ttyS0"]);

        store.delete("/dev/ttyS0").unwrap();
        store.clear().unwrap();
        assert!(JsonProfileStore::open(&path).unwrap().entries().is_empty());
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        fs::write(&path, "not json").unwrap();

        assert!(matches!(
            JsonProfileStore::open(&path),
            Err(StoreError::Format(_))
        ));
    }
}
