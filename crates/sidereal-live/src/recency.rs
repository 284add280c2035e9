//! Least-recently-updated ordering for capacity eviction.
//!
//! The aggregators keep their state in a `DashMap` and stamp every entry with
//! the instant it was last touched. This index mirrors those stamps in a
//! sorted set so the oldest entry is found in `O(log n)` instead of a scan
//! over every shard.
//!
//! Lock order is always map shard, then index. `touch` and `forget` are called
//! while the caller holds the entry (or runs inside `retain`); `pop_oldest`
//! releases the index lock before the caller goes back to the map.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub(crate) struct RecencyIndex<K> {
    order: Mutex<BTreeSet<(Instant, K)>>,
}

impl<K: Ord + Clone> RecencyIndex<K> {
    pub fn new() -> Self {
        Self {
            order: Mutex::new(BTreeSet::new()),
        }
    }

    /// Move `key` from its `previous` stamp to `now`.
    ///
    /// `previous` is `None` for a key that was just created.
    pub fn touch(&self, key: &K, previous: Option<Instant>, now: Instant) {
        let mut order = self.order.lock();
        if let Some(previous) = previous {
            if previous == now {
                return;
            }
            order.remove(&(previous, key.clone()));
        }
        order.insert((now, key.clone()));
    }

    pub fn forget(&self, key: &K, stamp: Instant) {
        self.order.lock().remove(&(stamp, key.clone()));
    }

    /// Take the oldest entry that is not `keep` out of the index.
    ///
    /// The caller must check the stamp against the map before evicting: the
    /// key may have been touched since.
    pub fn pop_oldest(&self, keep: &K) -> Option<(Instant, K)> {
        let mut order = self.order.lock();
        let victim = order.iter().find(|(_, key)| key != keep).cloned()?;
        order.remove(&victim);
        Some(victim)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.order.lock().len()
    }
}
