//! Bounded in-memory telemetry store.
//!
//! One store instance exists per record kind. Entries are kept in insertion
//! order in a `VecDeque` behind a `parking_lot::RwLock`; inserts hold the
//! write lock only long enough to push and evict, queries take a read lock.
//! Once the store holds `capacity` entries each insert evicts the oldest one,
//! so `len()` never exceeds the capacity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

/// A stored record with its insertion metadata.
#[derive(Debug)]
pub struct StoreEntry<T> {
    /// Monotonic, gap-free insertion sequence, starting at 1.
    pub sequence: u64,
    pub inserted_at: Instant,
    pub record: Arc<T>,
}

impl<T> Clone for StoreEntry<T> {
    fn clone(&self) -> Self {
        Self {
            sequence: self.sequence,
            inserted_at: self.inserted_at,
            record: Arc::clone(&self.record),
        }
    }
}

/// Bounded FIFO store for one kind of record.
#[derive(Debug)]
pub struct TelemetryStore<T> {
    name: &'static str,
    capacity: usize,
    entries: RwLock<VecDeque<StoreEntry<T>>>,
    // Both counters are only written while holding the entries write lock.
    last_sequence: AtomicU64,
    evicted: AtomicU64,
}

impl<T> TelemetryStore<T> {
    /// Create a store holding at most `capacity` entries (minimum 1).
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
            last_sequence: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries currently retained.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Sequence number of the most recent insert, or 0 if nothing was inserted.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    /// Total entries evicted by capacity or age since creation.
    pub fn evicted_total(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Insert a single record, evicting the oldest entry if over capacity.
    pub fn insert(&self, record: T) -> StoreEntry<T> {
        let mut entries = self.entries.write();
        self.push_locked(&mut entries, Arc::new(record))
    }

    /// Insert records atomically: readers observe all of them or none.
    pub fn insert_batch(&self, records: impl IntoIterator<Item = T>) -> Vec<StoreEntry<T>> {
        let records: Vec<Arc<T>> = records.into_iter().map(Arc::new).collect();
        if records.is_empty() {
            return Vec::new();
        }

        let mut entries = self.entries.write();
        let inserted: Vec<StoreEntry<T>> = records
            .into_iter()
            .map(|record| self.push_locked(&mut entries, record))
            .collect();
        drop(entries);

        tracing::trace!(store = self.name, count = inserted.len(), "Inserted batch");
        inserted
    }

    fn push_locked(&self, entries: &mut VecDeque<StoreEntry<T>>, record: Arc<T>) -> StoreEntry<T> {
        let sequence = self.last_sequence.load(Ordering::Relaxed) + 1;
        self.last_sequence.store(sequence, Ordering::Release);

        let entry = StoreEntry {
            sequence,
            inserted_at: Instant::now(),
            record,
        };
        entries.push_back(entry.clone());

        let mut evicted = 0;
        while entries.len() > self.capacity {
            entries.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            self.evicted.fetch_add(evicted, Ordering::Relaxed);
        }
        entry
    }

    /// Up to `limit` most recent entries matching `predicate`, newest first.
    pub fn query<F>(&self, mut predicate: F, limit: usize) -> Vec<StoreEntry<T>>
    where
        F: FnMut(&T) -> bool,
    {
        self.entries
            .read()
            .iter()
            .rev()
            .filter(|entry| predicate(&*entry.record))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Up to `limit` most recent entries, newest first.
    pub fn latest(&self, limit: usize) -> Vec<StoreEntry<T>> {
        self.query(|_| true, limit)
    }

    /// Up to `limit` entries matching `predicate` inserted after `sequence`,
    /// oldest first, plus the cursor to resume from.
    ///
    /// The cursor is the sequence of the last entry examined, so entries
    /// skipped by the predicate are not scanned again on the next call.
    /// Entries already evicted are simply absent; callers can detect a gap by
    /// comparing the first returned sequence with `sequence + 1`.
    pub fn replay<F>(&self, sequence: u64, mut predicate: F, limit: usize) -> (Vec<StoreEntry<T>>, u64)
    where
        F: FnMut(&T) -> bool,
    {
        let entries = self.entries.read();
        let start = entries.partition_point(|e| e.sequence <= sequence);
        let mut cursor = sequence;
        let mut matched = Vec::new();
        for entry in entries.range(start..) {
            if matched.len() >= limit {
                break;
            }
            cursor = entry.sequence;
            if predicate(&*entry.record) {
                matched.push(entry.clone());
            }
        }
        (matched, cursor)
    }

    /// Evict every entry inserted more than `max_age` ago.
    ///
    /// Returns the number of entries removed.
    pub fn prune_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let mut removed = 0;
        while entries
            .front()
            .is_some_and(|e| now.saturating_duration_since(e.inserted_at) > max_age)
        {
            entries.pop_front();
            removed += 1;
        }
        drop(entries);

        if removed > 0 {
            self.evicted.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(store = self.name, removed, "Pruned aged entries");
        }
        removed
    }

    /// Remove every entry. Sequence numbering continues where it left off.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
