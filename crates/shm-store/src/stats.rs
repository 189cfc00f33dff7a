use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Passive counters updated by the lifecycle manager.
#[derive(Debug, Default)]
pub struct StoreStats {
    objects_created: AtomicU64,
    objects_sealed: AtomicU64,
    objects_deleted: AtomicU64,
    objects_aborted: AtomicU64,
    objects_evicted: AtomicU64,
    bytes_evicted: AtomicU64,
    creates_failed: AtomicU64,
    fallback_allocations: AtomicU64,
}

impl StoreStats {
    pub(crate) fn record_create(&self, fallback: bool) {
        self.objects_created.fetch_add(1, Ordering::Relaxed);
        if fallback {
            self.fallback_allocations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_seal(&self) {
        self.objects_sealed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.objects_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.objects_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self, bytes: usize) {
        self.objects_evicted.fetch_add(1, Ordering::Relaxed);
        self.bytes_evicted.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_create(&self) {
        self.creates_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fill(&self, snapshot: &mut StatsSnapshot) {
        snapshot.objects_created = self.objects_created.load(Ordering::Relaxed);
        snapshot.objects_sealed = self.objects_sealed.load(Ordering::Relaxed);
        snapshot.objects_deleted = self.objects_deleted.load(Ordering::Relaxed);
        snapshot.objects_aborted = self.objects_aborted.load(Ordering::Relaxed);
        snapshot.objects_evicted = self.objects_evicted.load(Ordering::Relaxed);
        snapshot.bytes_evicted = self.bytes_evicted.load(Ordering::Relaxed);
        snapshot.creates_failed = self.creates_failed.load(Ordering::Relaxed);
        snapshot.fallback_allocations = self.fallback_allocations.load(Ordering::Relaxed);
    }
}

/// Point-in-time view of store counters and gauges.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub primary_used: u64,
    pub primary_capacity: u64,
    pub fallback_used: u64,
    pub fallback_capacity: u64,
    pub objects_live: u64,
    pub objects_evictable: u64,
    pub mutable_objects: u64,
    pub objects_created: u64,
    pub objects_sealed: u64,
    pub objects_deleted: u64,
    pub objects_aborted: u64,
    pub objects_evicted: u64,
    pub bytes_evicted: u64,
    pub creates_failed: u64,
    pub fallback_allocations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = StoreStats::default();
        stats.record_create(false);
        stats.record_create(true);
        stats.record_eviction(100);
        stats.record_eviction(50);
        stats.record_failed_create();

        let mut snap = StatsSnapshot::default();
        stats.fill(&mut snap);
        assert_eq!(snap.objects_created, 2);
        assert_eq!(snap.fallback_allocations, 1);
        assert_eq!(snap.objects_evicted, 2);
        assert_eq!(snap.bytes_evicted, 150);
        assert_eq!(snap.creates_failed, 1);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let snap = StatsSnapshot {
            primary_used: 10,
            ..Default::default()
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["primary_used"], 10);
    }
}
