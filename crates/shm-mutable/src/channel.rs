//! One mutable object: payload, header and the wait/notify protocol.
//!
//! All protocol state lives in [`ChannelState`] behind one mutex. Two
//! condition variables separate the wakeups: `readable` for readers waiting
//! on a new version, `writable` for a writer waiting on acknowledgements.
//! Every wait re-checks its predicate in a loop and observes the `closed`
//! flag, so spurious wakeups and teardown are both handled.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use shm_alloc::{Allocator, Block};
use shm_types::{Backing, ObjectId};
use tracing::{debug, trace};

use crate::error::{MutableError, MutableResult};
use crate::header::{MutableHeader, HEADER_LEN};
use crate::lease::{ReadLease, WriteLease};

#[derive(Debug, Default)]
pub(crate) struct ChannelState {
    pub(crate) version: u64,
    pub(crate) data_size: usize,
    pub(crate) metadata_size: usize,
    /// Subscribers that have not yet acknowledged the current version.
    pub(crate) outstanding_readers: u32,
    /// Read leases currently alive (the writer may not touch the payload).
    pub(crate) active_readers: u32,
    pub(crate) writer_active: bool,
    pub(crate) closed: bool,
}

/// A single-writer, multi-reader mutable object.
pub struct Channel {
    id: ObjectId,
    subscriber_count: u32,
    capacity: usize,
    block: Block,
    state: Mutex<ChannelState>,
    readable: Condvar,
    writable: Condvar,
}

impl Channel {
    pub(crate) fn create(
        allocator: &Arc<dyn Allocator>,
        id: ObjectId,
        capacity: usize,
        subscriber_count: u32,
    ) -> MutableResult<Self> {
        if subscriber_count == 0 {
            return Err(MutableError::InvalidState(
                "a mutable object needs at least one subscriber".into(),
            ));
        }
        let block = Block::allocate(allocator, HEADER_LEN + capacity)?;
        let channel = Self {
            id,
            subscriber_count,
            capacity,
            block,
            state: Mutex::new(ChannelState::default()),
            readable: Condvar::new(),
            writable: Condvar::new(),
        };
        {
            let state = channel.lock();
            channel.store_header(&state);
        }
        Ok(channel)
    }

    /// The channel's object ID.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Number of readers expected to acknowledge every version.
    pub fn subscriber_count(&self) -> u32 {
        self.subscriber_count
    }

    /// Payload capacity in bytes (data plus metadata).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Which region holds the channel.
    pub fn backing(&self) -> Backing {
        self.block.backing()
    }

    /// The latest published version (0 before the first write).
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Returns `true` once the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Read the header back from shared memory.
    pub fn header(&self) -> MutableHeader {
        let _state = self.lock();
        // SAFETY: the header range is only written under the state lock,
        // which we hold.
        let bytes = unsafe { self.block.allocation().bytes_at(0, HEADER_LEN) };
        bytes
            .ok()
            .and_then(MutableHeader::decode)
            .unwrap_or_default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().expect("channel lock poisoned")
    }

    fn store_header(&self, state: &ChannelState) {
        let header = MutableHeader {
            version: state.version,
            data_size: state.data_size as u64,
            metadata_size: state.metadata_size as u64,
            outstanding_readers: state.outstanding_readers,
            subscriber_count: self.subscriber_count,
            closed: state.closed,
        };
        // SAFETY: the header range is only accessed under the state lock,
        // which the caller holds (witnessed by `state`).
        let written = unsafe { self.block.allocation().write_at(0, &header.encode()) };
        debug_assert!(written.is_ok());
    }

    /// Wait on `condvar` until `ready` holds, the channel closes or the
    /// deadline passes.
    fn wait_until<'a>(
        &self,
        mut state: MutexGuard<'a, ChannelState>,
        condvar: &Condvar,
        timeout: Duration,
        ready: impl Fn(&ChannelState) -> bool,
    ) -> MutableResult<MutexGuard<'a, ChannelState>> {
        let deadline = Instant::now() + timeout;
        loop {
            if state.closed {
                return Err(MutableError::Disconnected(self.id));
            }
            if ready(&*state) {
                return Ok(state);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MutableError::Timeout {
                    id: self.id,
                    waited: timeout,
                });
            }
            let (guard, _) = condvar
                .wait_timeout(state, remaining)
                .expect("channel lock poisoned");
            state = guard;
        }
    }

    pub(crate) fn write_acquire(self: &Arc<Self>, timeout: Duration) -> MutableResult<WriteLease> {
        let state = self.lock();
        let mut state = self.wait_until(state, &self.writable, timeout, |s| {
            !s.writer_active && s.outstanding_readers == 0 && s.active_readers == 0
        })?;
        state.writer_active = true;
        trace!(id = %self.id, version = state.version, "write acquired");
        Ok(WriteLease::new(Arc::clone(self)))
    }

    pub(crate) fn write_commit(&self, data_size: usize, metadata_size: usize) -> MutableResult<u64> {
        let mut state = self.lock();
        state.writer_active = false;
        if state.closed {
            return Err(MutableError::Disconnected(self.id));
        }
        state.version += 1;
        state.data_size = data_size;
        state.metadata_size = metadata_size;
        state.outstanding_readers = self.subscriber_count;
        self.store_header(&state);
        let version = state.version;
        drop(state);

        self.readable.notify_all();
        debug!(id = %self.id, version, data_size, metadata_size, "mutable object written");
        Ok(version)
    }

    pub(crate) fn write_abort(&self) {
        let mut state = self.lock();
        state.writer_active = false;
        drop(state);
        self.writable.notify_all();
        self.readable.notify_all();
    }

    pub(crate) fn read_acquire(
        self: &Arc<Self>,
        last_seen_version: u64,
        timeout: Duration,
    ) -> MutableResult<ReadLease> {
        let state = self.lock();
        let mut state = self.wait_until(state, &self.readable, timeout, |s| {
            s.version > last_seen_version && !s.writer_active
        })?;
        state.active_readers += 1;
        trace!(id = %self.id, version = state.version, "read acquired");
        Ok(ReadLease::new(
            Arc::clone(self),
            state.version,
            state.data_size,
            state.metadata_size,
        ))
    }

    /// Acknowledge `version`. Only a lease for the current version consumes
    /// a subscriber slot; stale or surplus leases just drop their pin.
    pub(crate) fn read_commit(&self, version: u64) -> MutableResult<()> {
        let mut state = self.lock();
        state.active_readers = state.active_readers.saturating_sub(1);
        if version == state.version && state.outstanding_readers > 0 {
            state.outstanding_readers -= 1;
        }
        self.store_header(&state);
        let writer_may_proceed = state.outstanding_readers == 0 && state.active_readers == 0;
        let closed = state.closed;
        drop(state);

        if writer_may_proceed {
            self.writable.notify_all();
        }
        if closed {
            return Err(MutableError::Disconnected(self.id));
        }
        Ok(())
    }

    /// Close the channel and wake every waiter.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.store_header(&state);
        drop(state);

        self.readable.notify_all();
        self.writable.notify_all();
        debug!(id = %self.id, "mutable object closed");
    }

    /// Payload bytes `[0, len)`.
    ///
    /// # Safety
    ///
    /// The caller holds a read lease (or the write lease), which keeps the
    /// writer (or everyone else) away from the payload.
    pub(crate) unsafe fn payload(&self, len: usize) -> &[u8] {
        self.block
            .allocation()
            .bytes_at(HEADER_LEN, len)
            .unwrap_or(&[])
    }

    /// Full mutable payload.
    ///
    /// # Safety
    ///
    /// The caller holds the write lease.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn payload_mut(&self) -> &mut [u8] {
        self.block
            .allocation()
            .bytes_mut_at(HEADER_LEN, self.capacity)
            .unwrap_or(&mut [])
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("subscriber_count", &self.subscriber_count)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shm_alloc::PrimaryArena;

    fn channel(capacity: usize) -> Arc<Channel> {
        let allocator: Arc<dyn Allocator> = Arc::new(PrimaryArena::anonymous(1024).unwrap());
        let id = ObjectId::digest(b"chan");
        Arc::new(Channel::create(&allocator, id, capacity, 1).unwrap())
    }

    #[test]
    fn close_is_visible_to_state_and_header() {
        let chan = channel(16);
        assert!(!chan.is_closed());
        assert!(!chan.header().closed);

        chan.close();
        chan.close();
        assert!(chan.is_closed());
        assert!(chan.header().closed);
        assert!(matches!(
            chan.read_acquire(0, Duration::from_millis(10)),
            Err(MutableError::Disconnected(_))
        ));
        assert!(matches!(
            chan.write_acquire(Duration::from_millis(10)),
            Err(MutableError::Disconnected(_))
        ));
    }

    #[test]
    fn zero_subscribers_is_rejected() {
        let allocator: Arc<dyn Allocator> = Arc::new(PrimaryArena::anonymous(1024).unwrap());
        let result = Channel::create(&allocator, ObjectId::digest(b"chan"), 16, 0);
        assert!(matches!(result, Err(MutableError::InvalidState(_))));
        assert_eq!(allocator.used(), 0);
    }
}
