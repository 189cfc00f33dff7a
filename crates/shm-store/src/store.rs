use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use shm_alloc::{Allocator, FallbackAllocator, PrimaryArena, TieredAllocator};
use shm_mutable::{MutableObjectManager, HEADER_LEN};
use shm_types::{Backing, ClientId, ObjectId};
use tracing::{debug, info, warn};

use crate::buffer::{ObjectBuffer, Section};
use crate::config::StoreConfig;
use crate::directory::{CreateRequest, ObjectDirectory, ObjectInfo, ObjectRecord};
use crate::error::{StoreError, StoreResult};
use crate::eviction::EvictionPolicy;
use crate::stats::{StatsSnapshot, StoreStats};

/// Result of an eviction round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub objects: usize,
    pub bytes: usize,
}

/// Result of tearing down a client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisconnectReport {
    /// References the client still held.
    pub released: u32,
    /// Unsealed objects the client created and never sealed.
    pub aborted: usize,
}

struct Inner {
    directory: ObjectDirectory,
    eviction: EvictionPolicy,
}

/// The object lifecycle manager.
///
/// Owns the allocator, the object directory, the eviction candidate set and
/// the mutable-object manager. The directory and candidate set share one
/// lock, held only for bookkeeping; byte copies and block frees run
/// outside it.
pub struct ObjectStore {
    config: StoreConfig,
    allocator: Arc<TieredAllocator>,
    inner: Mutex<Inner>,
    mutable: MutableObjectManager,
    stats: StoreStats,
}

impl ObjectStore {
    /// Map the configured regions and start an empty store.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let primary_capacity = config.primary_bytes()?;
        let primary = match &config.primary_dir {
            Some(dir) => PrimaryArena::file_backed(dir, primary_capacity)?,
            None => PrimaryArena::anonymous(primary_capacity)?,
        };
        let fallback = match &config.fallback_dir {
            Some(dir) if config.fallback_capacity > 0 => {
                FallbackAllocator::new(dir, config.fallback_bytes()?)?
            }
            _ => FallbackAllocator::disabled(),
        };
        let allocator = Arc::new(TieredAllocator::new(
            primary,
            fallback,
            config.max_allocation_bytes()?,
        ));
        let shared: Arc<dyn Allocator> = allocator.clone();

        info!(
            primary_capacity,
            fallback_capacity = allocator.fallback().capacity(),
            max_allocation = allocator.max_allocation(),
            "object store ready"
        );
        Ok(Self {
            mutable: MutableObjectManager::new(Arc::clone(&shared), config.mutable_timeout()),
            inner: Mutex::new(Inner {
                directory: ObjectDirectory::new(shared),
                eviction: EvictionPolicy::new(),
            }),
            stats: StoreStats::default(),
            allocator,
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn allocator(&self) -> &TieredAllocator {
        &self.allocator
    }

    /// Mutable objects share this store's allocator.
    pub fn mutable(&self) -> &MutableObjectManager {
        &self.mutable
    }

    /// Allocate a new object, evicting unreferenced objects once if space
    /// is short.
    ///
    /// The creator holds one reference to the new object. Requests larger
    /// than the maximum single allocation fail with `OutOfMemory` and evict
    /// nothing; if eviction cannot make room the result is
    /// `ObjectStoreFull`.
    pub fn create_object(&self, request: CreateRequest) -> StoreResult<ObjectInfo> {
        let err = match self.try_create(&request) {
            Ok(info) => return Ok(info),
            Err(err) => err,
        };
        if !err.is_capacity() || self.exceeds_max_allocation(&request) {
            if err.is_capacity() {
                self.stats.record_failed_create();
            }
            return Err(err);
        }

        let needed = request.total_size();
        self.make_room(&request.id, needed);
        match self.try_create(&request) {
            Ok(info) => Ok(info),
            Err(err) if err.is_capacity() => Err(self.store_full(request.id, needed, &err)),
            Err(err) => Err(err),
        }
    }

    /// Create a mutable object with `capacity` payload bytes, evicting
    /// unreferenced immutable objects once if space is short.
    ///
    /// The channel's header and payload share one allocation from this
    /// store's allocator.
    pub fn create_mutable(
        &self,
        id: ObjectId,
        capacity: usize,
        subscriber_count: u32,
    ) -> StoreResult<()> {
        let err = match self.mutable.create_channel(id, capacity, subscriber_count) {
            Ok(()) => return Ok(()),
            Err(err) => StoreError::from(err),
        };
        let needed = HEADER_LEN.saturating_add(capacity);
        if !err.is_capacity() || needed > self.allocator.max_allocation() {
            if err.is_capacity() {
                self.stats.record_failed_create();
            }
            return Err(err);
        }

        self.make_room(&id, needed);
        match self.mutable.create_channel(id, capacity, subscriber_count) {
            Ok(()) => Ok(()),
            Err(err) => match StoreError::from(err) {
                err if err.is_capacity() => Err(self.store_full(id, needed, &err)),
                err => Err(err),
            },
        }
    }

    /// Copy `bytes` into an unsealed object's data at `offset`.
    pub fn write_data(&self, id: &ObjectId, offset: usize, bytes: &[u8]) -> StoreResult<()> {
        self.write_section(id, Section::Data, offset, bytes)
    }

    /// Copy `bytes` into an unsealed object's metadata at `offset`.
    pub fn write_metadata(&self, id: &ObjectId, offset: usize, bytes: &[u8]) -> StoreResult<()> {
        self.write_section(id, Section::Metadata, offset, bytes)
    }

    pub fn seal_object(&self, id: &ObjectId) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(size) = inner.directory.seal_object(id)? {
            inner.eviction.add(*id, size);
        }
        self.stats.record_seal();
        Ok(())
    }

    /// Create, fill and seal an object in one call.
    ///
    /// The creator keeps its reference. If filling or sealing fails the
    /// object is aborted.
    pub fn put(
        &self,
        client: ClientId,
        id: ObjectId,
        data: &[u8],
        metadata: &[u8],
    ) -> StoreResult<ObjectInfo> {
        let request = CreateRequest::new(client, id, data.len()).with_metadata(metadata.len());
        self.create_object(request)?;
        let filled = self
            .write_data(&id, 0, data)
            .and_then(|()| self.write_metadata(&id, 0, metadata))
            .and_then(|()| self.seal_object(&id));
        if let Err(err) = filled {
            if let Err(abort_err) = self.abort_object(client, &id) {
                warn!(%id, error = %abort_err, "failed to abort partially written object");
            }
            return Err(err);
        }
        self.info(&id)
    }

    /// Take a reference to a sealed object and return a zero-copy view.
    pub fn get(&self, client: ClientId, id: &ObjectId) -> StoreResult<ObjectBuffer> {
        let mut inner = self.lock();
        let (buffer, was_candidate) = inner.directory.get(client, id)?;
        if was_candidate {
            inner.eviction.remove(id);
        }
        Ok(buffer)
    }

    /// [`get`](Self::get) for each ID in turn.
    pub fn get_batch(&self, client: ClientId, ids: &[ObjectId]) -> Vec<StoreResult<ObjectBuffer>> {
        ids.iter().map(|id| self.get(client, id)).collect()
    }

    pub fn release(&self, client: ClientId, id: &ObjectId) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(size) = inner.directory.release(client, id)? {
            inner.eviction.add(*id, size);
        }
        Ok(())
    }

    /// Remove an unreferenced object immediately.
    pub fn delete_object(&self, id: &ObjectId) -> StoreResult<()> {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.directory.delete_object(id)?;
            inner.eviction.remove(id);
            removed
        };
        drop(removed);
        self.stats.record_delete();
        Ok(())
    }

    /// Discard an object its creator has not sealed.
    pub fn abort_object(&self, client: ClientId, id: &ObjectId) -> StoreResult<()> {
        let removed = self.lock().directory.abort(client, id)?;
        drop(removed);
        self.stats.record_abort();
        Ok(())
    }

    /// Returns `true` if `id` names a sealed object.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.lock().directory.contains(id)
    }

    pub fn info(&self, id: &ObjectId) -> StoreResult<ObjectInfo> {
        self.lock()
            .directory
            .info(id)
            .ok_or(StoreError::ObjectNotFound(*id))
    }

    /// Every live object, ordered by ID.
    pub fn list(&self) -> Vec<ObjectInfo> {
        self.lock().directory.list()
    }

    /// Evict least-recently-released objects until at least `bytes` have
    /// been freed or no candidates remain.
    ///
    /// Candidates whose bytes are still pinned by an [`ObjectBuffer`] are
    /// passed over and stay candidates; evicting them would free nothing.
    pub fn evict(&self, bytes: usize) -> EvictionReport {
        let mut report = EvictionReport::default();
        let mut skipped = HashSet::new();
        while report.bytes < bytes {
            let victims = self
                .lock()
                .eviction
                .select_victims_except(bytes - report.bytes, &skipped);
            if victims.is_empty() {
                break;
            }
            let round = self.evict_victims(&victims, &mut skipped);
            report.objects += round.objects;
            report.bytes += round.bytes;
        }
        if report.objects > 0 {
            info!(
                requested = bytes,
                objects = report.objects,
                bytes = report.bytes,
                "eviction round complete"
            );
        }
        report
    }

    /// Drop every reference `client` holds and abort the objects it left
    /// unsealed.
    pub fn disconnect_client(&self, client: ClientId) -> DisconnectReport {
        let release = {
            let mut inner = self.lock();
            let release = inner.directory.release_client(client);
            for (id, size) in &release.candidates {
                inner.eviction.add(*id, *size);
            }
            release
        };
        for _ in &release.aborted {
            self.stats.record_abort();
        }
        let report = DisconnectReport {
            released: release.released,
            aborted: release.aborted.len(),
        };
        info!(%client, released = report.released, aborted = report.aborted, "client disconnected");
        report
    }

    /// Current counters and gauges.
    pub fn stats(&self) -> StatsSnapshot {
        let (objects_live, objects_evictable) = {
            let inner = self.lock();
            (inner.directory.len(), inner.eviction.len())
        };
        let primary = self.allocator.primary();
        let fallback = self.allocator.fallback();
        let mut snapshot = StatsSnapshot {
            primary_used: primary.used() as u64,
            primary_capacity: primary.capacity() as u64,
            fallback_used: fallback.used() as u64,
            fallback_capacity: fallback.capacity() as u64,
            objects_live: objects_live as u64,
            objects_evictable: objects_evictable as u64,
            mutable_objects: self.mutable.len() as u64,
            ..Default::default()
        };
        self.stats.fill(&mut snapshot);
        snapshot
    }

    fn try_create(&self, request: &CreateRequest) -> StoreResult<ObjectInfo> {
        let info = self.lock().directory.create_object(request)?;
        self.stats
            .record_create(info.backing == Some(Backing::Fallback));
        Ok(info)
    }

    /// Evict enough to cover what the primary arena lacks for a `needed`
    /// byte allocation.
    fn make_room(&self, id: &ObjectId, needed: usize) {
        let shortfall = needed.saturating_sub(self.allocator.primary().available());
        // No shortfall means the free space is too fragmented; free a whole
        // request's worth.
        let target = if shortfall == 0 { needed } else { shortfall };
        let report = self.evict(target);
        debug!(%id, needed, freed = report.bytes, "retrying create after eviction");
    }

    fn store_full(&self, id: ObjectId, needed: usize, err: &StoreError) -> StoreError {
        self.stats.record_failed_create();
        warn!(%id, needed, error = %err, "object store full");
        StoreError::ObjectStoreFull {
            id,
            requested: needed,
        }
    }

    fn exceeds_max_allocation(&self, request: &CreateRequest) -> bool {
        let max = self.allocator.max_allocation();
        request.data_size > max || request.metadata_size > max
    }

    /// Delete each victim that is still unreferenced and unpinned, taking
    /// the lock per victim. Victims that cannot be evicted are added to
    /// `skipped`.
    fn evict_victims(
        &self,
        victims: &[ObjectId],
        skipped: &mut HashSet<ObjectId>,
    ) -> EvictionReport {
        let mut report = EvictionReport::default();
        for id in victims {
            let evicted: Option<ObjectRecord> = {
                let mut inner = self.lock();
                let evicted = inner.directory.evict(id);
                if evicted.is_some() {
                    inner.eviction.remove(id);
                }
                evicted
            };
            match evicted {
                Some(record) => {
                    // Unpinned under the lock, so this drop returns the bytes.
                    let size = record.size();
                    drop(record);
                    report.objects += 1;
                    report.bytes += size;
                    self.stats.record_eviction(size);
                    debug!(%id, size, "object evicted");
                }
                None => {
                    skipped.insert(*id);
                    debug!(%id, "eviction victim referenced or pinned; skipped");
                }
            }
        }
        report
    }

    fn write_section(
        &self,
        id: &ObjectId,
        section: Section,
        offset: usize,
        bytes: &[u8],
    ) -> StoreResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let block = self
            .lock()
            .directory
            .begin_write(id, section, offset, bytes.len())?;
        // SAFETY: the object is unsealed, so no reader can see the block, and
        // the in-flight write keeps it from being sealed until end_write.
        let copied = unsafe { block.allocation().write_at(offset, bytes) };
        self.lock().directory.end_write(id);
        copied?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("store lock poisoned")
    }
}

impl Drop for ObjectStore {
    fn drop(&mut self) {
        self.mutable.shutdown();
        info!("object store shut down");
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("allocator", &self.allocator)
            .field("mutable", &self.mutable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use shm_types::ObjectState;
    use std::time::Duration;

    const CREATOR: ClientId = ClientId::new(1);
    const READER: ClientId = ClientId::new(2);

    fn store(capacity: u64) -> ObjectStore {
        ObjectStore::open(StoreConfig::with_capacity(capacity)).unwrap()
    }

    fn id(name: &str) -> ObjectId {
        ObjectId::digest(name.as_bytes())
    }

    fn filled(len: usize, byte: u8) -> Vec<u8> {
        vec![byte; len]
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = store(4096);
        let obj = id("obj");
        let info = store.put(CREATOR, obj, b"payload", b"meta").unwrap();
        assert_eq!(info.state, ObjectState::Sealed);
        assert_eq!(info.ref_count, 1);
        assert!(info.sealed_at.is_some());

        let buf = store.get(READER, &obj).unwrap();
        assert_eq!(buf.data(), b"payload");
        assert_eq!(buf.metadata(), b"meta");
        assert_eq!(store.info(&obj).unwrap().ref_count, 2);
        assert!(store.contains(&obj));
    }

    #[test]
    fn create_release_delete_restores_free_bytes() {
        let store = store(4096);
        let before = store.allocator().available();
        let obj = id("x");
        store
            .create_object(CreateRequest::new(CREATOR, obj, 700).with_metadata(20))
            .unwrap();
        store.write_data(&obj, 0, &filled(700, 1)).unwrap();
        store.seal_object(&obj).unwrap();
        store.release(CREATOR, &obj).unwrap();
        store.delete_object(&obj).unwrap();

        assert_eq!(store.allocator().available(), before);
        assert!(matches!(
            store.get(READER, &obj),
            Err(StoreError::ObjectNotFound(_))
        ));
        assert_eq!(store.stats().objects_evictable, 0);
    }

    #[test]
    fn end_to_end_eviction_scenario() {
        let store = store(1000);
        let (a, b, c) = (id("A"), id("B"), id("C"));

        store.put(CREATOR, a, &filled(500, 0xA), b"").unwrap();
        store.put(CREATOR, b, &filled(400, 0xB), b"").unwrap();

        // A and B are both referenced: nothing may be evicted.
        assert!(matches!(
            store.create_object(CreateRequest::new(CREATOR, c, 300)),
            Err(StoreError::ObjectStoreFull { .. })
        ));
        assert!(store.info(&c).is_err());
        assert_eq!(store.allocator().used(), 900);

        store.release(CREATOR, &a).unwrap();
        let info = store
            .create_object(CreateRequest::new(CREATOR, c, 300))
            .unwrap();
        assert_eq!(info.backing, Some(Backing::Primary));

        assert!(matches!(
            store.get(READER, &a),
            Err(StoreError::ObjectNotFound(_))
        ));
        assert_eq!(store.get(READER, &b).unwrap().data(), filled(400, 0xB).as_slice());
        let stats = store.stats();
        assert_eq!(stats.objects_evicted, 1);
        assert_eq!(stats.bytes_evicted, 500);
        assert_eq!(stats.creates_failed, 1);
    }

    #[test]
    fn least_recently_released_is_evicted_first() {
        let store = store(300);
        for name in ["A", "B", "C"] {
            store.put(CREATOR, id(name), &filled(100, 0), b"").unwrap();
        }
        for name in ["A", "B", "C"] {
            store.release(CREATOR, &id(name)).unwrap();
        }

        let report = store.evict(200);
        assert_eq!(report, EvictionReport { objects: 2, bytes: 200 });
        assert!(!store.contains(&id("A")));
        assert!(!store.contains(&id("B")));
        assert!(store.contains(&id("C")));
    }

    #[test]
    fn referenced_objects_are_never_evicted() {
        let store = store(1000);
        store.put(CREATOR, id("held"), &filled(600, 1), b"").unwrap();
        let report = store.evict(1000);
        assert_eq!(report, EvictionReport::default());
        assert!(store.contains(&id("held")));
    }

    #[test]
    fn re_referenced_victim_is_skipped() {
        let store = store(1000);
        let obj = id("x");
        store.put(CREATOR, obj, &filled(100, 1), b"").unwrap();
        store.release(CREATOR, &obj).unwrap();

        let victims = store.lock().eviction.select_victims(100);
        assert_eq!(victims, vec![obj]);
        let _view = store.get(READER, &obj).unwrap();

        let mut skipped = HashSet::new();
        let report = store.evict_victims(&victims, &mut skipped);
        assert_eq!(report.objects, 0);
        assert!(skipped.contains(&obj));
        assert!(store.contains(&obj));
    }

    #[test]
    fn create_evicts_exactly_the_two_oldest() {
        let store = store(300);
        for name in ["A", "B", "C"] {
            store.put(CREATOR, id(name), &filled(100, 0), b"").unwrap();
            store.release(CREATOR, &id(name)).unwrap();
        }

        let info = store
            .create_object(CreateRequest::new(CREATOR, id("D"), 200))
            .unwrap();
        assert_eq!(info.backing, Some(Backing::Primary));
        assert!(!store.contains(&id("A")));
        assert!(!store.contains(&id("B")));
        assert!(store.contains(&id("C")));
        let stats = store.stats();
        assert_eq!(stats.objects_evicted, 2);
        assert_eq!(stats.bytes_evicted, 200);
        assert_eq!(stats.primary_used, 300);
    }

    #[test]
    fn released_object_with_live_view_is_not_evicted() {
        let store = store(1000);
        let (a, b, c) = (id("A"), id("B"), id("C"));
        store.put(CREATOR, a, &filled(500, 0xA), b"").unwrap();
        store.put(CREATOR, b, &filled(400, 0xB), b"").unwrap();

        let view = store.get(READER, &a).unwrap();
        store.release(READER, &a).unwrap();
        store.release(CREATOR, &a).unwrap();

        assert!(matches!(
            store.create_object(CreateRequest::new(CREATOR, c, 300)),
            Err(StoreError::ObjectStoreFull { .. })
        ));
        assert!(store.contains(&a));
        assert_eq!(view.data(), filled(500, 0xA).as_slice());
        let stats = store.stats();
        assert_eq!(stats.objects_evicted, 0);
        assert_eq!(stats.bytes_evicted, 0);
        assert_eq!(stats.objects_evictable, 1);
        assert_eq!(stats.primary_used, 900);

        drop(view);
        store.create_object(CreateRequest::new(CREATOR, c, 300)).unwrap();
        assert!(!store.contains(&a));
        assert_eq!(store.stats().bytes_evicted, 500);
    }

    #[test]
    fn pinned_oldest_candidate_is_passed_over() {
        let store = store(900);
        for name in ["A", "B", "C"] {
            store.put(CREATOR, id(name), &filled(300, 0), b"").unwrap();
        }
        let view = store.get(READER, &id("A")).unwrap();
        store.release(READER, &id("A")).unwrap();
        for name in ["A", "B", "C"] {
            store.release(CREATOR, &id(name)).unwrap();
        }

        store
            .create_object(CreateRequest::new(CREATOR, id("D"), 200))
            .unwrap();
        assert!(store.contains(&id("A")));
        assert!(!store.contains(&id("B")));
        assert!(store.contains(&id("C")));
        assert_eq!(store.stats().bytes_evicted, 300);
        assert_eq!(view.data_size(), 300);
    }

    #[test]
    fn buffer_locations_describe_the_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::with_capacity(1000).with_fallback(dir.path(), 4096);
        let store = ObjectStore::open(config).unwrap();

        store.put(CREATOR, id("a"), b"data", b"meta").unwrap();
        let view = store.get(READER, &id("a")).unwrap();
        let data = view.data_location().unwrap();
        let meta = view.metadata_location().unwrap();
        assert_eq!(data.backing, Backing::Primary);
        assert_eq!(data.path, None);
        assert_eq!((data.len, meta.len), (4, 4));
        assert_ne!(data.offset, meta.offset);

        store.put(CREATOR, id("bare"), b"x", b"").unwrap();
        assert!(store.get(READER, &id("bare")).unwrap().metadata_location().is_none());

        store
            .create_object(CreateRequest::new(CREATOR, id("fill"), 991))
            .unwrap();
        store.put(CREATOR, id("spill"), b"0123456789", b"").unwrap();
        let spill = store.get(READER, &id("spill")).unwrap();
        let location = spill.data_location().unwrap();
        assert_eq!(location.backing, Backing::Fallback);
        let path = location.path.unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());
        assert_eq!(location.len, 10);
    }

    #[test]
    fn create_mutable_evicts_to_make_room() {
        let store = store(1000);
        store.put(CREATOR, id("idle"), &filled(900, 1), b"").unwrap();
        store.release(CREATOR, &id("idle")).unwrap();

        let chan = id("chan");
        store.create_mutable(chan, 200, 1).unwrap();
        assert!(!store.contains(&id("idle")));
        let stats = store.stats();
        assert_eq!(stats.mutable_objects, 1);
        assert_eq!(stats.objects_evicted, 1);
        assert_eq!(stats.primary_used, (HEADER_LEN + 200) as u64);

        store.mutable().write(&chan, b"v1", b"", None).unwrap();
        let lease = store
            .mutable()
            .read_acquire(&chan, 0, Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(lease.data(), b"v1");
    }

    #[test]
    fn create_mutable_fails_without_evicting_referenced_or_oversized() {
        let store = store(1000);
        store.put(CREATOR, id("held"), &filled(900, 1), b"").unwrap();
        assert!(matches!(
            store.create_mutable(id("chan"), 200, 1),
            Err(StoreError::ObjectStoreFull { .. })
        ));
        assert!(store.contains(&id("held")));

        store.release(CREATOR, &id("held")).unwrap();
        assert!(matches!(
            store.create_mutable(id("huge"), 2000, 1),
            Err(StoreError::OutOfMemory(_))
        ));
        assert!(store.contains(&id("held")));

        let stats = store.stats();
        assert_eq!(stats.mutable_objects, 0);
        assert_eq!(stats.objects_evicted, 0);
        assert_eq!(stats.creates_failed, 2);
    }

    #[test]
    fn oversized_request_fails_without_evicting() {
        let store = store(1000);
        store.put(CREATOR, id("idle"), &filled(100, 1), b"").unwrap();
        store.release(CREATOR, &id("idle")).unwrap();

        let err = store
            .create_object(CreateRequest::new(CREATOR, id("huge"), 2000))
            .unwrap_err();
        assert!(matches!(err, StoreError::OutOfMemory(_)));
        assert!(store.contains(&id("idle")));
        assert_eq!(store.stats().objects_evicted, 0);
    }

    #[test]
    fn fallback_activates_when_primary_is_exactly_full() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::with_capacity(1000).with_fallback(dir.path(), 4096);
        let store = ObjectStore::open(config).unwrap();

        let first = store
            .create_object(CreateRequest::new(CREATOR, id("fill"), 1000))
            .unwrap();
        assert_eq!(first.backing, Some(Backing::Primary));
        assert_eq!(store.allocator().primary().used(), 1000);

        let spill = store
            .create_object(CreateRequest::new(CREATOR, id("spill"), 10))
            .unwrap();
        assert_eq!(spill.backing, Some(Backing::Fallback));
        assert_eq!(store.stats().fallback_allocations, 1);
        assert_eq!(store.stats().fallback_used, 10);

        store.write_data(&id("spill"), 0, b"0123456789").unwrap();
        store.seal_object(&id("spill")).unwrap();
        assert_eq!(store.get(READER, &id("spill")).unwrap().data(), b"0123456789");
    }

    #[test]
    fn failed_create_leaves_no_record() {
        let store = store(100);
        store.put(CREATOR, id("a"), &filled(80, 1), b"").unwrap();
        assert!(store
            .create_object(CreateRequest::new(CREATOR, id("b"), 50))
            .is_err());
        assert!(store.info(&id("b")).is_err());
        assert_eq!(store.allocator().used(), 80);
    }

    #[test]
    fn duplicate_create_does_not_evict() {
        let store = store(1000);
        store.put(CREATOR, id("idle"), &filled(10, 1), b"").unwrap();
        store.release(CREATOR, &id("idle")).unwrap();
        assert!(matches!(
            store.put(CREATOR, id("idle"), b"x", b""),
            Err(StoreError::ObjectExists(_))
        ));
        assert!(store.contains(&id("idle")));
    }

    #[test]
    fn writes_are_bounded_and_sealed_objects_are_immutable() {
        let store = store(1000);
        let obj = id("x");
        store.create_object(CreateRequest::new(CREATOR, obj, 4)).unwrap();
        assert!(matches!(
            store.write_data(&obj, 2, b"abc"),
            Err(StoreError::InvalidState(_))
        ));
        store.write_data(&obj, 0, b"ab").unwrap();
        store.write_data(&obj, 2, b"cd").unwrap();
        store.seal_object(&obj).unwrap();
        assert!(matches!(
            store.write_data(&obj, 0, b"zz"),
            Err(StoreError::InvalidState(_))
        ));
        assert!(matches!(
            store.seal_object(&obj),
            Err(StoreError::InvalidState(_))
        ));
        assert_eq!(store.get(READER, &obj).unwrap().data(), b"abcd");
    }

    #[test]
    fn delete_while_referenced_is_invalid() {
        let store = store(1000);
        store.put(CREATOR, id("x"), b"data", b"").unwrap();
        assert!(matches!(
            store.delete_object(&id("x")),
            Err(StoreError::InvalidState(_))
        ));
    }

    #[test]
    fn abort_frees_the_allocation() {
        let store = store(1000);
        let obj = id("x");
        store.create_object(CreateRequest::new(CREATOR, obj, 300)).unwrap();
        store.abort_object(CREATOR, &obj).unwrap();
        assert_eq!(store.allocator().used(), 0);
        assert_eq!(store.stats().objects_aborted, 1);
    }

    #[test]
    fn get_batch_reports_each_object() {
        let store = store(1000);
        store.put(CREATOR, id("a"), b"A", b"").unwrap();
        let results = store.get_batch(READER, &[id("a"), id("missing")]);
        assert_eq!(results[0].as_ref().unwrap().data(), b"A");
        assert!(matches!(results[1], Err(StoreError::ObjectNotFound(_))));
    }

    #[test]
    fn disconnect_releases_holds_and_makes_candidates() {
        let store = store(1000);
        store.put(CREATOR, id("a"), b"A", b"").unwrap();
        store.get(READER, &id("a")).unwrap();
        store.create_object(CreateRequest::new(READER, id("pending"), 50)).unwrap();

        let report = store.disconnect_client(READER);
        assert_eq!(report, DisconnectReport { released: 2, aborted: 1 });
        assert_eq!(store.allocator().used(), 1);

        store.disconnect_client(CREATOR);
        assert_eq!(store.stats().objects_evictable, 1);
        assert_eq!(store.evict(1).bytes, 1);
    }

    #[test]
    fn mutable_objects_share_the_allocator() {
        let store = store(1000);
        let chan = id("chan");
        store.mutable().create_channel(chan, 100, 1).unwrap();
        assert!(store.allocator().used() > 100);

        let version = store.mutable().write(&chan, b"v1", b"", None).unwrap();
        let lease = store
            .mutable()
            .read_acquire(&chan, 0, Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(lease.version(), version);
        assert_eq!(lease.data(), b"v1");
        assert_eq!(store.stats().mutable_objects, 1);
    }

    #[test]
    fn drop_shuts_down_mutable_objects() {
        let store = store(1000);
        let chan = id("chan");
        store.mutable().create_channel(chan, 16, 1).unwrap();
        let writer = store.mutable().write_acquire(&chan, None).unwrap();
        drop(store);
        assert!(matches!(
            writer.commit(0, 0),
            Err(shm_mutable::MutableError::Disconnected(_))
        ));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Get(u8, u8),
        Release(u8, u8),
        Delete(u8),
        Evict(u16),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3u8, 0..4u8).prop_map(|(c, o)| Op::Get(c, o)),
            (0..3u8, 0..4u8).prop_map(|(c, o)| Op::Release(c, o)),
            (0..4u8).prop_map(Op::Delete),
            (0..400u16).prop_map(Op::Evict),
        ]
    }

    proptest! {
        #[test]
        fn ref_count_tracks_holds(ops in proptest::collection::vec(op(), 1..60)) {
            let store = store(4096);
            let objects: Vec<ObjectId> = (0..4).map(|i| id(&format!("obj-{i}"))).collect();
            for obj in &objects {
                store.put(CREATOR, *obj, &filled(100, 1), b"").unwrap();
                store.release(CREATOR, obj).unwrap();
            }
            // Model: holds per (client, object).
            let mut holds = [[0u32; 4]; 3];

            for op in ops {
                match op {
                    Op::Get(c, o) => {
                        let client = ClientId::new(10 + c as u64);
                        if store.get(client, &objects[o as usize]).is_ok() {
                            holds[c as usize][o as usize] += 1;
                        }
                    }
                    Op::Release(c, o) => {
                        let client = ClientId::new(10 + c as u64);
                        let result = store.release(client, &objects[o as usize]);
                        if holds[c as usize][o as usize] > 0 {
                            prop_assert!(result.is_ok());
                            holds[c as usize][o as usize] -= 1;
                        } else {
                            prop_assert!(result.is_err());
                        }
                    }
                    Op::Delete(o) => {
                        let total: u32 = holds.iter().map(|h| h[o as usize]).sum();
                        let result = store.delete_object(&objects[o as usize]);
                        if total > 0 {
                            prop_assert!(matches!(result, Err(StoreError::InvalidState(_))));
                        }
                    }
                    Op::Evict(bytes) => {
                        store.evict(bytes as usize);
                    }
                }

                for (o, obj) in objects.iter().enumerate() {
                    let total: u32 = holds.iter().map(|h| h[o]).sum();
                    match store.info(obj) {
                        Ok(info) => prop_assert_eq!(info.ref_count, total),
                        Err(_) => prop_assert_eq!(total, 0),
                    }
                }
            }
        }
    }
}
