use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Past this many keys, the map sheds everything not currently held.
const CLEANUP_THRESHOLD: usize = 4096;

/// An advisory lock map keyed by arbitrary strings. Acquiring a key's
/// lock serializes every holder of the same key; the returned guard
/// releases on drop, so release happens on every path, errors included.
///
/// This is purely cooperative and in-process. Running the bot as more
/// than one replica would need the exclusivity moved into the database
/// (an atomic conditional update) instead.
pub struct KeyedLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        KeyedLocks {
            inner: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Wait for and take the lock for `key`.
    pub async fn acquire(&self, key: String) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("lock map poisoned");

            // Keep the map from growing without bound: keys are per-user
            // and abandoned ones serve no purpose. A held lock has guards
            // alive elsewhere, so its Arc count gives it away.
            if map.len() > CLEANUP_THRESHOLD {
                map.retain(|_, lock| Arc::strong_count(lock) > 1);
            }

            map.entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        lock.lock_owned().await
    }

    #[cfg(test)]
    pub fn key_count(&self) -> usize {
        self.inner.lock().expect("lock map poisoned").len()
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}
