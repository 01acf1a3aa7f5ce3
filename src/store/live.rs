//! In-memory live store: fixed-capacity indexed ring buffer
//!
//! Backs the low-latency UI view. Writes overwrite the oldest slot when the
//! buffer is full; overwritten entries become unreachable by id immediately.
//! Not durable by design - the persistent store carries durability.

use crate::capture::types::{LiveCapacity, RequestId, RequestRecord, StoredRequest};
use crate::store::filter::RecordFilter;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};

/// Statistics about live store usage
#[derive(Clone, Copy, Debug, Default)]
pub struct LiveStoreStats {
    pub total_inserts: u64,
    pub overwrites: u64,
}

struct LiveState {
    slots: Vec<Option<StoredRequest>>,
    /// Next slot to write
    head: usize,
    total_inserts: u64,
    overwrites: u64,
    by_id: HashMap<RequestId, usize>,
    /// Per-method slot positions, newest at the back. Capped at the ring
    /// capacity per method; stale entries are re-validated at read time.
    by_method: HashMap<String, VecDeque<usize>>,
}

impl LiveState {
    /// Slot indices newest-first over occupied slots
    fn newest_first(&self) -> impl Iterator<Item = &StoredRequest> {
        let capacity = self.slots.len();
        (1..=capacity)
            .map(move |age| (self.head + capacity - age) % capacity)
            .filter_map(|idx| self.slots[idx].as_ref())
    }
}

/// Bounded in-memory ring buffer of captured requests with id and method indexes
///
/// A single reader/writer lock protects the buffer and both indexes: reads
/// proceed concurrently, writes are exclusive.
pub struct LiveStore {
    capacity: usize,
    state: RwLock<LiveState>,
}

impl LiveStore {
    pub fn new(capacity: LiveCapacity) -> Self {
        let capacity = *capacity.as_ref();
        Self {
            capacity,
            state: RwLock::new(LiveState {
                slots: vec![None; capacity],
                head: 0,
                total_inserts: 0,
                overwrites: 0,
                by_id: HashMap::new(),
                by_method: HashMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a record, evicting whatever occupies the current head slot.
    /// Never fails.
    pub fn add(&self, record: RequestRecord) -> StoredRequest {
        let stored = StoredRequest::new(record);
        let mut state = self.state.write();

        let slot = state.head;
        if let Some(evicted) = state.slots[slot].take() {
            state.by_id.remove(&evicted.id);
            state.overwrites += 1;
        }

        state.by_id.insert(stored.id, slot);
        let method_key = stored.record.method.to_uppercase();
        let capacity = self.capacity;
        let positions = state.by_method.entry(method_key).or_default();
        positions.push_back(slot);
        if positions.len() > capacity {
            positions.pop_front();
        }

        state.slots[slot] = Some(stored.clone());
        state.head = (slot + 1) % self.capacity;
        state.total_inserts += 1;
        stored
    }

    pub fn get(&self, id: RequestId) -> Option<StoredRequest> {
        let state = self.state.read();
        state
            .by_id
            .get(&id)
            .and_then(|slot| state.slots[*slot].clone())
    }

    /// Filtered, newest-first page of requests plus the total match count
    /// before pagination
    pub fn list(&self, filter: &RecordFilter) -> (Vec<StoredRequest>, u64) {
        let state = self.state.read();
        let matches = self.collect_matches(&state, filter);

        let total = matches.len() as u64;
        let rows = matches
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        (rows, total)
    }

    /// All occupied slots, newest first
    pub fn snapshot(&self) -> Vec<StoredRequest> {
        let state = self.state.read();
        state.newest_first().cloned().collect()
    }

    /// Stream matching entries to `visit`, newest first, stopping early when
    /// the visitor returns false
    pub fn iterate<F>(&self, filter: &RecordFilter, mut visit: F)
    where
        F: FnMut(&StoredRequest) -> bool,
    {
        let state = self.state.read();
        for stored in self.collect_matches(&state, filter) {
            if !visit(stored) {
                break;
            }
        }
    }

    pub fn stats(&self) -> LiveStoreStats {
        let state = self.state.read();
        LiveStoreStats {
            total_inserts: state.total_inserts,
            overwrites: state.overwrites,
        }
    }

    /// Matching entries newest-first. With a method filter the per-method
    /// index provides the candidate set; every candidate is re-validated
    /// against the live slot content, since slots may have been overwritten
    /// after the index entry was recorded.
    fn collect_matches<'a>(
        &self,
        state: &'a LiveState,
        filter: &RecordFilter,
    ) -> Vec<&'a StoredRequest> {
        match &filter.method {
            Some(method) => {
                let mut seen = HashSet::new();
                let mut matches = Vec::new();
                if let Some(positions) = state.by_method.get(&method.to_uppercase()) {
                    for slot in positions.iter().rev() {
                        if !seen.insert(*slot) {
                            continue;
                        }
                        if let Some(stored) = state.slots[*slot].as_ref() {
                            if filter.matches(&stored.record) {
                                matches.push(stored);
                            }
                        }
                    }
                }
                matches
            }
            None => state
                .newest_first()
                .filter(|stored| filter.matches(&stored.record))
                .collect(),
        }
    }
}
