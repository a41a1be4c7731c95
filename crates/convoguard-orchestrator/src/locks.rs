use convoguard_core::SessionKey;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-conversation async mutexes.
///
/// Unrelated keys never contend. Entries are created on first use and
/// removed when the last holder releases.
#[derive(Default)]
pub struct KeyLocks {
    locks: DashMap<SessionKey, Arc<Mutex<()>>>,
}

/// Exclusive access to one key. Released on drop, including when the future
/// holding it is cancelled.
pub struct KeyGuard<'a> {
    owner: &'a KeyLocks,
    key: SessionKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &SessionKey) -> KeyGuard<'_> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        KeyGuard {
            owner: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no lock entries exist.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    fn release(&self, key: &SessionKey) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Unlock first so the map entry is the only remaining reference.
        self.guard.take();
        self.owner.release(&self.key);
    }
}
