//! Ids proposed somewhere in the pool but not yet confirmed.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Set of reserved ids with the time each was reserved.
///
/// A reservation keeps concurrent allocations from proposing the same id.
/// It is released when the id shows up for real (a server joins under it)
/// or ages out after the pool's reservation TTL.
#[derive(Debug, Clone)]
pub struct ReservationSet<T: Ord + Copy> {
    entries: BTreeMap<T, Instant>,
}

impl<T: Ord + Copy> Default for ReservationSet<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: Ord + Copy> ReservationSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `id`. Returns false if it was already reserved.
    pub fn reserve(&mut self, id: T, now: Instant) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, now);
        true
    }

    pub fn contains(&self, id: T) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn release(&mut self, id: T) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Highest reserved id.
    pub fn max(&self) -> Option<T> {
        self.entries.keys().next_back().copied()
    }

    /// Drops reservations older than `ttl`. Returns how many were dropped.
    pub fn prune(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, reserved_at| now.saturating_duration_since(*reserved_at) < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
