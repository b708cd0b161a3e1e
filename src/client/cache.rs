use std::collections::HashMap;
use std::sync::Mutex;

/// Process-local map from volume id to resolved rdir host.
///
/// A hit only saves a directory round trip; every consumer must tolerate a
/// stale or missing entry, so the mutex is never held across an await and
/// invalidation is a plain delete. Injectable so tests can pre-populate it.
#[derive(Debug, Default)]
pub struct AddressCache {
    entries: Mutex<HashMap<String, String>>,
}

impl AddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn prefilled(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: Mutex::new(entries.into_iter().collect()),
        }
    }

    pub fn get(&self, volume_id: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("address cache poisoned")
            .get(volume_id)
            .cloned()
    }

    pub fn insert(&self, volume_id: &str, host: &str) {
        self.entries
            .lock()
            .expect("address cache poisoned")
            .insert(volume_id.to_string(), host.to_string());
    }

    /// Idempotent; called whenever a call using a cached host fails with a
    /// network-level error.
    pub fn invalidate(&self, volume_id: &str) {
        self.entries
            .lock()
            .expect("address cache poisoned")
            .remove(volume_id);
    }
}
