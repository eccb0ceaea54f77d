//! Recently-processed transaction cache.
//!
//! Purely an optimization: it keeps a transaction seen through both the
//! mempool and a block from being matched twice. The persisted index never
//! depends on it for correctness, so entries can be dropped at any time.

use bitcoin::Txid;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Bounded, time-limited set of recently processed txids.
pub struct DedupCache {
    entries: Mutex<IndexMap<Txid, Instant>>,
    capacity: usize,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            capacity,
            ttl,
        }
    }

    /// True when the txid was recorded within the TTL.
    pub fn contains(&self, txid: &Txid) -> bool {
        let entries = self.entries.lock();
        entries
            .get(txid)
            .is_some_and(|seen| seen.elapsed() < self.ttl)
    }

    /// Records a txid, refreshing its position if already present.
    pub fn insert(&self, txid: Txid) {
        let mut entries = self.entries.lock();
        // Re-insert at the back so eviction order stays oldest-first.
        entries.shift_remove(&txid);
        entries.insert(txid, Instant::now());
        self.sweep(&mut entries);
    }

    /// Forgets a txid (evicted double-spend loser, dropped mempool entry).
    pub fn remove(&self, txid: &Txid) {
        self.entries.lock().shift_remove(txid);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn sweep(&self, entries: &mut IndexMap<Txid, Instant>) {
        while entries
            .first()
            .is_some_and(|(_, seen)| seen.elapsed() >= self.ttl)
        {
            entries.shift_remove_index(0);
        }
        while entries.len() > self.capacity {
            entries.shift_remove_index(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn txid(n: u8) -> Txid {
        Txid::from_byte_array([n; 32])
    }

    #[test]
    fn remembers_and_forgets() {
        let cache = DedupCache::new(10, Duration::from_secs(60));
        cache.insert(txid(1));
        assert!(cache.contains(&txid(1)));
        assert!(!cache.contains(&txid(2)));

        cache.remove(&txid(1));
        assert!(!cache.contains(&txid(1)));
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let cache = DedupCache::new(3, Duration::from_secs(60));
        for n in 1..=4 {
            cache.insert(txid(n));
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&txid(1)));
        assert!(cache.contains(&txid(4)));
    }

    #[test]
    fn reinsertion_refreshes_eviction_order() {
        let cache = DedupCache::new(3, Duration::from_secs(60));
        for n in 1..=3 {
            cache.insert(txid(n));
        }
        cache.insert(txid(1));
        cache.insert(txid(4));
        // 2 was the oldest untouched entry.
        assert!(!cache.contains(&txid(2)));
        assert!(cache.contains(&txid(1)));
    }

    #[test]
    fn entries_expire() {
        let cache = DedupCache::new(10, Duration::from_millis(10));
        cache.insert(txid(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.contains(&txid(1)));
        // A new insertion sweeps the expired entry out.
        cache.insert(txid(2));
        assert_eq!(cache.len(), 1);
    }
}
