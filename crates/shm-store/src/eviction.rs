//! Least-recently-released eviction ordering.
//!
//! The candidate set holds every sealed object whose reference count is
//! zero, ordered by when it reached zero. Release order is a monotonically
//! increasing sequence number, so objects released in the same batch keep
//! their insertion order.

use std::collections::{BTreeMap, HashMap, HashSet};

use shm_types::ObjectId;

/// Ordered set of eviction candidates.
///
/// The policy only proposes victims. Whoever deletes them must re-check
/// that each victim is still unreferenced first.
#[derive(Debug, Default)]
pub struct EvictionPolicy {
    clock: u64,
    /// Release sequence -> (object, size in bytes).
    order: BTreeMap<u64, (ObjectId, usize)>,
    /// Object -> its release sequence.
    index: HashMap<ObjectId, u64>,
    total_bytes: usize,
}

impl EvictionPolicy {
    /// Create an empty candidate set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` as released now. Re-adding an existing candidate moves
    /// it to the back.
    pub fn add(&mut self, id: ObjectId, size: usize) {
        self.remove(&id);
        let seq = self.clock;
        self.clock += 1;
        self.order.insert(seq, (id, size));
        self.index.insert(id, seq);
        self.total_bytes += size;
    }

    /// Drop `id` from the candidate set. Returns `true` if it was present.
    pub fn remove(&mut self, id: &ObjectId) -> bool {
        let Some(seq) = self.index.remove(id) else {
            return false;
        };
        if let Some((_, size)) = self.order.remove(&seq) {
            self.total_bytes -= size;
        }
        true
    }

    /// Oldest-released candidates whose sizes add up to at least
    /// `bytes_needed`, or every candidate if they do not.
    pub fn select_victims(&self, bytes_needed: usize) -> Vec<ObjectId> {
        self.select_victims_except(bytes_needed, &HashSet::new())
    }

    /// [`select_victims`](Self::select_victims), passing over the candidates
    /// in `skip`. Their sizes do not count towards `bytes_needed`.
    pub fn select_victims_except(
        &self,
        bytes_needed: usize,
        skip: &HashSet<ObjectId>,
    ) -> Vec<ObjectId> {
        let mut victims = Vec::new();
        let mut freed = 0usize;
        for (id, size) in self.order.values() {
            if freed >= bytes_needed {
                break;
            }
            if skip.contains(id) {
                continue;
            }
            victims.push(*id);
            freed += size;
        }
        victims
    }

    /// Returns `true` if `id` is a candidate.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index.contains_key(id)
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns `true` if there are no candidates.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Sum of candidate sizes.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Candidates, oldest release first.
    pub fn candidates(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.order.values().map(|(id, _)| *id)
    }
}
