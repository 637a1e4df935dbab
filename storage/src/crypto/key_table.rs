use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::key_source::{KeyLocator, KeyMaterial, KeySource};
use super::CryptoError;

/// Key-id → key store in the style of a key server's table.
///
/// `lookup` serves cached entries and fills misses from `loader`. As a
/// [`KeySource`] the table reloads the key on every resolve, so each session
/// sees the current key and a loader outage fails the open.
pub struct KeyTable {
    loader: Arc<dyn KeySource>,
    entries: DashMap<KeyLocator, KeyMaterial>,
}

impl KeyTable {
    pub fn new(loader: Arc<dyn KeySource>) -> Self {
        Self {
            loader,
            entries: DashMap::new(),
        }
    }

    /// Load `key_id` and insert it, replacing any existing entry.
    pub fn add(&self, key_id: &KeyLocator) -> Result<KeyMaterial, CryptoError> {
        let key = self.loader.resolve(key_id)?;
        self.entries.insert(key_id.clone(), key.clone());
        debug!(key_id = %key_id.fingerprint(), "key table entry added");
        Ok(key)
    }

    /// Copy of the cached key, loading it first on a miss.
    pub fn lookup(&self, key_id: &KeyLocator) -> Result<KeyMaterial, CryptoError> {
        if let Some(entry) = self.entries.get(key_id) {
            return Ok(entry.value().clone());
        }
        self.add(key_id)
    }

    pub fn delete(&self, key_id: &KeyLocator) -> Result<(), CryptoError> {
        match self.entries.remove(key_id) {
            Some(_) => {
                info!(key_id = %key_id.fingerprint(), "key table entry deleted");
                Ok(())
            }
            None => Err(CryptoError::KeyNotFound(key_id.fingerprint())),
        }
    }

    pub fn contains(&self, key_id: &KeyLocator) -> bool {
        self.entries.contains_key(key_id)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeySource for KeyTable {
    fn name(&self) -> &str {
        "key-table"
    }

    fn resolve(&self, locator: &KeyLocator) -> Result<KeyMaterial, CryptoError> {
        self.add(locator)
    }
}
