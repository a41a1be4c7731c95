//! Bounded LRU cache of decrypted session state.

use convoguard_core::{ConvoError, ConvoResult, SessionKey, SessionState};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

struct CacheEntry {
    state: SessionState,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<SessionKey, CacheEntry>,
    /// Recency index: lowest tick is least recently used.
    recency: BTreeMap<u64, SessionKey>,
    next_tick: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }
}

/// In-process LRU cache with a fixed entry cap.
///
/// The cache only ever holds state that is already durable, so eviction is a
/// memory decision and never loses data. The lock guards map bookkeeping only
/// and is never held across I/O.
pub struct StateCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl StateCache {
    /// Create a cache holding at most `capacity` sessions.
    pub fn new(capacity: usize) -> ConvoResult<Self> {
        if capacity == 0 {
            return Err(ConvoError::Config("cache capacity must be at least 1".into()));
        }
        Ok(Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Look up a session, marking it most recently used on a hit.
    pub fn get(&self, key: &SessionKey) -> Option<SessionState> {
        let mut guard = self.inner.lock();
        let tick = guard.bump();
        let Inner {
            entries, recency, ..
        } = &mut *guard;

        let entry = entries.get_mut(key)?;
        recency.remove(&entry.tick);
        recency.insert(tick, key.clone());
        entry.tick = tick;
        Some(entry.state.clone())
    }

    /// Insert or replace a session.
    ///
    /// Inserting a new key into a full cache first evicts the least recently
    /// used entry; the evicted key is returned.
    pub fn put(&self, state: SessionState) -> Option<SessionKey> {
        let mut guard = self.inner.lock();
        let tick = guard.bump();
        let Inner {
            entries, recency, ..
        } = &mut *guard;

        if let Some(entry) = entries.get_mut(&state.key) {
            recency.remove(&entry.tick);
            recency.insert(tick, state.key.clone());
            entry.tick = tick;
            entry.state = state;
            return None;
        }

        let mut evicted = None;
        if entries.len() >= self.capacity {
            if let Some((_, victim)) = recency.pop_first() {
                entries.remove(&victim);
                evicted = Some(victim);
            }
        }

        recency.insert(tick, state.key.clone());
        entries.insert(state.key.clone(), CacheEntry { state, tick });
        evicted
    }

    /// Drop a session from the cache.
    pub fn remove(&self, key: &SessionKey) -> Option<SessionState> {
        let mut guard = self.inner.lock();
        let entry = guard.entries.remove(key)?;
        guard.recency.remove(&entry.tick);
        Some(entry.state)
    }

    /// Whether the key is cached. Does not affect recency.
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Number of cached sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed entry cap.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cached keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<SessionKey> {
        self.inner.lock().recency.values().cloned().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn state(key: &str) -> SessionState {
        SessionState::new(SessionKey::new(key))
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(StateCache::new(0), Err(ConvoError::Config(_))));
    }

    #[test]
    fn get_miss_returns_none() {
        let cache = StateCache::new(2).unwrap();
        assert!(cache.get(&"nope".into()).is_none());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = StateCache::new(2).unwrap();
        assert!(cache.put(state("a")).is_none());
        assert!(cache.put(state("b")).is_none());

        // Touch "a" so "b" becomes the LRU entry.
        assert!(cache.get(&"a".into()).is_some());

        let evicted = cache.put(state("c"));
        assert_eq!(evicted, Some(SessionKey::new("b")));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&"a".into()));
        assert!(cache.contains(&"c".into()));
    }

    #[test]
    fn replacing_existing_key_does_not_evict() {
        let cache = StateCache::new(2).unwrap();
        cache.put(state("a"));
        cache.put(state("b"));

        let mut updated = state("a");
        updated.payload = b"v2".to_vec();
        assert!(cache.put(updated).is_none());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a".into()).unwrap().payload, b"v2");
        assert_eq!(
            cache.keys_by_recency(),
            vec![SessionKey::new("b"), SessionKey::new("a")]
        );
    }

    #[test]
    fn remove_clears_recency() {
        let cache = StateCache::new(2).unwrap();
        cache.put(state("a"));
        cache.put(state("b"));
        assert!(cache.remove(&"a".into()).is_some());
        assert!(cache.keys_by_recency() == vec![SessionKey::new("b")]);
        assert!(cache.put(state("c")).is_none());
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let cache = StateCache::new(100).unwrap();
        for i in 0..1_000 {
            cache.put(state(&format!("k{i}")));
            if i % 3 == 0 {
                cache.get(&SessionKey::new(format!("k{}", i / 2)));
            }
            assert!(cache.len() <= cache.capacity());
        }
        assert_eq!(cache.len(), 100);
    }

    #[test]
    fn evicted_key_is_always_lru_among_entries() {
        let cache = StateCache::new(5).unwrap();
        for i in 0..5 {
            cache.put(state(&format!("k{i}")));
        }
        for round in 0..50 {
            let touch = SessionKey::new(format!("k{}", (round * 7) % 5));
            cache.get(&touch);
            let expected = cache.keys_by_recency().first().cloned();
            let evicted = cache.put(state(&format!("new{round}")));
            assert_eq!(evicted, expected);
        }
    }
}
