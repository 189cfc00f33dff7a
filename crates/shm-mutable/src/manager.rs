use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use shm_alloc::Allocator;
use shm_types::ObjectId;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::error::{MutableError, MutableResult};
use crate::header::MutableHeader;
use crate::lease::{ReadLease, WriteLease};

/// Registry of mutable objects sharing one allocator.
///
/// Mutable objects are allocated like any other object but never sealed or
/// evicted; they live until [`remove_channel`](Self::remove_channel) or
/// [`shutdown`](Self::shutdown).
pub struct MutableObjectManager {
    allocator: Arc<dyn Allocator>,
    channels: RwLock<HashMap<ObjectId, Arc<Channel>>>,
    default_timeout: Duration,
}

impl MutableObjectManager {
    /// Create a manager. `default_timeout` bounds every wait whose caller
    /// passes no explicit timeout.
    pub fn new(allocator: Arc<dyn Allocator>, default_timeout: Duration) -> Self {
        Self {
            allocator,
            channels: RwLock::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Create a mutable object with `capacity` payload bytes and a fixed
    /// number of subscribers.
    pub fn create_channel(
        &self,
        id: ObjectId,
        capacity: usize,
        subscriber_count: u32,
    ) -> MutableResult<()> {
        let mut channels = self.channels.write().expect("channels lock poisoned");
        if channels.contains_key(&id) {
            return Err(MutableError::ObjectExists(id));
        }
        let channel = Channel::create(&self.allocator, id, capacity, subscriber_count)?;
        info!(
            %id,
            capacity,
            subscriber_count,
            backing = %channel.backing(),
            "mutable object created"
        );
        channels.insert(id, Arc::new(channel));
        Ok(())
    }

    /// Block until the previous version has been acknowledged by every
    /// subscriber, then take exclusive write access.
    pub fn write_acquire(&self, id: &ObjectId, timeout: Option<Duration>) -> MutableResult<WriteLease> {
        let channel = self.channel(id)?;
        channel.write_acquire(timeout.unwrap_or(self.default_timeout))
    }

    /// Publish a write: record sizes, bump the version and wake readers.
    pub fn write_release(
        &self,
        lease: WriteLease,
        data_size: usize,
        metadata_size: usize,
    ) -> MutableResult<u64> {
        lease.commit(data_size, metadata_size)
    }

    /// Acquire, copy `data` and `metadata` in, and publish.
    pub fn write(
        &self,
        id: &ObjectId,
        data: &[u8],
        metadata: &[u8],
        timeout: Option<Duration>,
    ) -> MutableResult<u64> {
        self.write_acquire(id, timeout)?.write(data, metadata)
    }

    /// Block until a version newer than `last_seen_version` is published.
    pub fn read_acquire(
        &self,
        id: &ObjectId,
        last_seen_version: u64,
        timeout: Option<Duration>,
    ) -> MutableResult<ReadLease> {
        let channel = self.channel(id)?;
        channel.read_acquire(last_seen_version, timeout.unwrap_or(self.default_timeout))
    }

    /// Acknowledge a read. The last acknowledgement wakes the writer.
    pub fn read_release(&self, lease: ReadLease) -> MutableResult<()> {
        lease.release()
    }

    /// Tear down a channel's peers: every current and future waiter gets
    /// [`MutableError::Disconnected`]. The channel stays registered.
    pub fn close_channel(&self, id: &ObjectId) -> MutableResult<()> {
        self.channel(id)?.close();
        Ok(())
    }

    /// Close and unregister a channel. Its memory returns to the allocator
    /// once outstanding leases drop.
    pub fn remove_channel(&self, id: &ObjectId) -> MutableResult<()> {
        let channel = self
            .channels
            .write()
            .expect("channels lock poisoned")
            .remove(id)
            .ok_or(MutableError::ObjectNotFound(*id))?;
        channel.close();
        debug!(%id, "mutable object removed");
        Ok(())
    }

    /// The latest published version of a channel.
    pub fn version(&self, id: &ObjectId) -> MutableResult<u64> {
        Ok(self.channel(id)?.version())
    }

    /// The channel header as stored in shared memory.
    pub fn header(&self, id: &ObjectId) -> MutableResult<MutableHeader> {
        Ok(self.channel(id)?.header())
    }

    /// Returns `true` if a channel with this ID is registered.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.channels
            .read()
            .expect("channels lock poisoned")
            .contains_key(id)
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.read().expect("channels lock poisoned").len()
    }

    /// Returns `true` if no channels are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and unregister every channel.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Channel>> = self
            .channels
            .write()
            .expect("channels lock poisoned")
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in &drained {
            channel.close();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "mutable objects shut down");
        }
    }

    fn channel(&self, id: &ObjectId) -> MutableResult<Arc<Channel>> {
        self.channels
            .read()
            .expect("channels lock poisoned")
            .get(id)
            .cloned()
            .ok_or(MutableError::ObjectNotFound(*id))
    }
}

impl std::fmt::Debug for MutableObjectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableObjectManager")
            .field("channel_count", &self.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HEADER_LEN;
    use shm_alloc::PrimaryArena;
    use std::sync::mpsc;
    use std::thread;

    const SHORT: Option<Duration> = Some(Duration::from_millis(50));
    const LONG: Option<Duration> = Some(Duration::from_secs(5));

    fn manager(capacity: usize) -> (Arc<dyn Allocator>, MutableObjectManager) {
        let allocator: Arc<dyn Allocator> = Arc::new(PrimaryArena::anonymous(capacity).unwrap());
        let mgr = MutableObjectManager::new(Arc::clone(&allocator), Duration::from_secs(5));
        (allocator, mgr)
    }

    fn id(name: &str) -> ObjectId {
        ObjectId::digest(name.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    #[test]
    fn create_allocates_header_and_payload() {
        let (allocator, mgr) = manager(4096);
        mgr.create_channel(id("ch"), 100, 2).unwrap();
        assert_eq!(allocator.used(), HEADER_LEN + 100);
        assert!(mgr.contains(&id("ch")));
        assert_eq!(mgr.version(&id("ch")).unwrap(), 0);

        let header = mgr.header(&id("ch")).unwrap();
        assert_eq!(header.subscriber_count, 2);
        assert_eq!(header.version, 0);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let (_, mgr) = manager(4096);
        mgr.create_channel(id("ch"), 10, 1).unwrap();
        assert!(matches!(
            mgr.create_channel(id("ch"), 10, 1),
            Err(MutableError::ObjectExists(_))
        ));
    }

    #[test]
    fn zero_subscribers_is_invalid() {
        let (allocator, mgr) = manager(4096);
        assert!(matches!(
            mgr.create_channel(id("ch"), 10, 0),
            Err(MutableError::InvalidState(_))
        ));
        assert_eq!(allocator.used(), 0);
    }

    #[test]
    fn create_propagates_out_of_memory() {
        let (_, mgr) = manager(64);
        assert!(matches!(
            mgr.create_channel(id("ch"), 64, 1),
            Err(MutableError::Alloc(_))
        ));
        assert!(mgr.is_empty());
    }

    #[test]
    fn unknown_channel_is_not_found() {
        let (_, mgr) = manager(4096);
        assert!(matches!(
            mgr.write_acquire(&id("nope"), SHORT),
            Err(MutableError::ObjectNotFound(_))
        ));
        assert!(matches!(
            mgr.read_acquire(&id("nope"), 0, SHORT),
            Err(MutableError::ObjectNotFound(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Versioning
    // -----------------------------------------------------------------------

    #[test]
    fn write_release_bumps_version_by_one() {
        let (_, mgr) = manager(4096);
        mgr.create_channel(id("ch"), 64, 1).unwrap();

        let mut lease = mgr.write_acquire(&id("ch"), SHORT).unwrap();
        lease.buffer_mut()[..5].copy_from_slice(b"hello");
        lease.buffer_mut()[5..7].copy_from_slice(b"md");
        assert_eq!(mgr.write_release(lease, 5, 2).unwrap(), 1);

        let read = mgr.read_acquire(&id("ch"), 0, SHORT).unwrap();
        assert_eq!(read.version(), 1);
        assert_eq!(read.data(), b"hello");
        assert_eq!(read.metadata(), b"md");
        mgr.read_release(read).unwrap();

        assert_eq!(mgr.write(&id("ch"), b"again", b"", SHORT).unwrap(), 2);
        let header = mgr.header(&id("ch")).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.data_size, 5);
        assert_eq!(header.outstanding_readers, 1);
    }

    #[test]
    fn reader_with_current_version_waits_for_next_write() {
        let (_, mgr) = manager(4096);
        let mgr = Arc::new(mgr);
        mgr.create_channel(id("ch"), 64, 1).unwrap();
        let v1 = mgr.write(&id("ch"), b"v1", b"", SHORT).unwrap();
        mgr.read_acquire(&id("ch"), 0, SHORT)
            .unwrap()
            .release()
            .unwrap();

        // Nothing newer than v1 yet.
        assert!(matches!(
            mgr.read_acquire(&id("ch"), v1, SHORT),
            Err(MutableError::Timeout { .. })
        ));

        let (tx, rx) = mpsc::channel();
        let reader = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || {
                tx.send(()).unwrap();
                let lease = mgr.read_acquire(&id("ch"), v1, LONG).unwrap();
                let seen = (lease.version(), lease.data().to_vec());
                lease.release().unwrap();
                seen
            })
        };
        rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        let v2 = mgr.write(&id("ch"), b"v2", b"", LONG).unwrap();

        assert_eq!(reader.join().unwrap(), (v2, b"v2".to_vec()));
        assert_eq!(v2, v1 + 1);
    }

    #[test]
    fn writer_waits_for_every_subscriber() {
        let (_, mgr) = manager(4096);
        let mgr = Arc::new(mgr);
        mgr.create_channel(id("ch"), 64, 2).unwrap();
        mgr.write(&id("ch"), b"first", b"", SHORT).unwrap();

        let r1 = mgr.read_acquire(&id("ch"), 0, SHORT).unwrap();
        mgr.read_release(r1).unwrap();

        // One subscriber has not acknowledged yet.
        assert!(matches!(
            mgr.write_acquire(&id("ch"), SHORT),
            Err(MutableError::Timeout { .. })
        ));

        let writer = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || mgr.write(&id("ch"), b"second", b"", LONG))
        };
        thread::sleep(Duration::from_millis(20));
        let r2 = mgr.read_acquire(&id("ch"), 0, SHORT).unwrap();
        assert_eq!(r2.data(), b"first");
        mgr.read_release(r2).unwrap();

        assert_eq!(writer.join().unwrap().unwrap(), 2);
    }

    #[test]
    fn timed_out_read_consumes_no_slot() {
        let (_, mgr) = manager(4096);
        mgr.create_channel(id("ch"), 64, 1).unwrap();
        mgr.write(&id("ch"), b"x", b"", SHORT).unwrap();
        assert!(mgr.read_acquire(&id("ch"), 1, SHORT).is_err());
        assert_eq!(mgr.header(&id("ch")).unwrap().outstanding_readers, 1);
    }

    #[test]
    fn dropped_read_lease_acknowledges() {
        let (_, mgr) = manager(4096);
        mgr.create_channel(id("ch"), 64, 1).unwrap();
        mgr.write(&id("ch"), b"x", b"", SHORT).unwrap();
        drop(mgr.read_acquire(&id("ch"), 0, SHORT).unwrap());
        assert_eq!(mgr.write(&id("ch"), b"y", b"", SHORT).unwrap(), 2);
    }

    #[test]
    fn abandoned_write_keeps_version() {
        let (_, mgr) = manager(4096);
        mgr.create_channel(id("ch"), 64, 1).unwrap();
        let mut lease = mgr.write_acquire(&id("ch"), SHORT).unwrap();
        lease.buffer_mut()[0] = 1;
        drop(lease);
        assert_eq!(mgr.version(&id("ch")).unwrap(), 0);
        // The writer slot is free again.
        assert_eq!(mgr.write(&id("ch"), b"ok", b"", SHORT).unwrap(), 1);
    }

    #[test]
    fn oversized_write_is_rejected_without_publishing() {
        let (_, mgr) = manager(4096);
        mgr.create_channel(id("ch"), 4, 1).unwrap();
        let lease = mgr.write_acquire(&id("ch"), SHORT).unwrap();
        assert!(matches!(
            mgr.write_release(lease, 4, 1),
            Err(MutableError::InvalidState(_))
        ));
        assert_eq!(mgr.version(&id("ch")).unwrap(), 0);
        assert!(matches!(
            mgr.write(&id("ch"), b"12345", b"", SHORT),
            Err(MutableError::InvalidState(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Disconnection
    // -----------------------------------------------------------------------

    #[test]
    fn close_releases_blocked_reader() {
        let (_, mgr) = manager(4096);
        let mgr = Arc::new(mgr);
        mgr.create_channel(id("ch"), 64, 1).unwrap();

        let reader = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || mgr.read_acquire(&id("ch"), 0, LONG))
        };
        thread::sleep(Duration::from_millis(20));
        mgr.close_channel(&id("ch")).unwrap();
        assert!(matches!(
            reader.join().unwrap(),
            Err(MutableError::Disconnected(_))
        ));
        assert!(mgr.header(&id("ch")).unwrap().closed);
    }

    #[test]
    fn close_releases_blocked_writer() {
        let (_, mgr) = manager(4096);
        let mgr = Arc::new(mgr);
        mgr.create_channel(id("ch"), 64, 1).unwrap();
        mgr.write(&id("ch"), b"unread", b"", SHORT).unwrap();

        let writer = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || mgr.write_acquire(&id("ch"), LONG).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));
        mgr.close_channel(&id("ch")).unwrap();
        assert!(matches!(
            writer.join().unwrap(),
            Err(MutableError::Disconnected(_))
        ));
    }

    #[test]
    fn operations_after_close_are_disconnected() {
        let (_, mgr) = manager(4096);
        mgr.create_channel(id("ch"), 64, 1).unwrap();
        let lease = mgr.write_acquire(&id("ch"), SHORT).unwrap();
        mgr.close_channel(&id("ch")).unwrap();
        assert!(matches!(
            lease.write(b"late", b""),
            Err(MutableError::Disconnected(_))
        ));
        assert!(matches!(
            mgr.write_acquire(&id("ch"), SHORT),
            Err(MutableError::Disconnected(_))
        ));
        assert!(matches!(
            mgr.read_acquire(&id("ch"), 0, SHORT),
            Err(MutableError::Disconnected(_))
        ));
    }

    #[test]
    fn remove_frees_memory_after_leases_drop() {
        let (allocator, mgr) = manager(4096);
        mgr.create_channel(id("ch"), 64, 1).unwrap();
        mgr.write(&id("ch"), b"bytes", b"", SHORT).unwrap();
        let lease = mgr.read_acquire(&id("ch"), 0, SHORT).unwrap();

        mgr.remove_channel(&id("ch")).unwrap();
        assert!(!mgr.contains(&id("ch")));
        // The lease still pins the payload.
        assert_eq!(lease.data(), b"bytes");
        assert_eq!(allocator.used(), HEADER_LEN + 64);
        drop(lease);
        assert_eq!(allocator.used(), 0);
    }

    #[test]
    fn shutdown_closes_everything() {
        let (allocator, mgr) = manager(4096);
        mgr.create_channel(id("a"), 8, 1).unwrap();
        mgr.create_channel(id("b"), 8, 1).unwrap();
        mgr.shutdown();
        assert!(mgr.is_empty());
        assert_eq!(allocator.used(), 0);
    }
}
