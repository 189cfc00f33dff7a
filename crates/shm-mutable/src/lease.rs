use std::sync::Arc;

use shm_types::ObjectId;

use crate::channel::Channel;
use crate::error::{MutableError, MutableResult};

/// Exclusive write access to a channel's payload.
///
/// Publish with [`commit`](Self::commit). Dropping an uncommitted lease
/// abandons the write: the version does not change and the next writer may
/// proceed.
#[derive(Debug)]
pub struct WriteLease {
    channel: Arc<Channel>,
    done: bool,
}

impl WriteLease {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            done: false,
        }
    }

    /// The channel being written.
    pub fn id(&self) -> ObjectId {
        self.channel.id()
    }

    /// Payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.channel.capacity()
    }

    /// The whole payload region. Data goes first, metadata right after it.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        // SAFETY: holding the write lease excludes every reader and any
        // other writer from the payload.
        unsafe { self.channel.payload_mut() }
    }

    /// Copy `data` and `metadata` into the payload and publish them.
    pub fn write(mut self, data: &[u8], metadata: &[u8]) -> MutableResult<u64> {
        let total = data.len() + metadata.len();
        if total > self.capacity() {
            return Err(MutableError::InvalidState(format!(
                "{total} bytes do not fit in a {}-byte mutable object",
                self.capacity()
            )));
        }
        let buf = self.buffer_mut();
        buf[..data.len()].copy_from_slice(data);
        buf[data.len()..total].copy_from_slice(metadata);
        self.commit(data.len(), metadata.len())
    }

    /// Publish the payload: record sizes, bump the version by one and wake
    /// every waiting reader. Returns the new version.
    pub fn commit(mut self, data_size: usize, metadata_size: usize) -> MutableResult<u64> {
        let fits = data_size
            .checked_add(metadata_size)
            .is_some_and(|total| total <= self.capacity());
        if !fits {
            return Err(MutableError::InvalidState(format!(
                "sizes {data_size}+{metadata_size} exceed the {}-byte mutable object",
                self.capacity()
            )));
        }
        self.done = true;
        self.channel.write_commit(data_size, metadata_size)
    }
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        if !self.done {
            self.channel.write_abort();
        }
    }
}

/// Read-only view of one published version.
///
/// While the lease lives the writer cannot overwrite the payload.
/// Acknowledge with [`release`](Self::release); dropping the lease
/// acknowledges it as well.
#[derive(Debug)]
pub struct ReadLease {
    channel: Arc<Channel>,
    version: u64,
    data_size: usize,
    metadata_size: usize,
    done: bool,
}

impl ReadLease {
    pub(crate) fn new(
        channel: Arc<Channel>,
        version: u64,
        data_size: usize,
        metadata_size: usize,
    ) -> Self {
        Self {
            channel,
            version,
            data_size,
            metadata_size,
            done: false,
        }
    }

    /// The channel being read.
    pub fn id(&self) -> ObjectId {
        self.channel.id()
    }

    /// The version this lease observes.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The published data bytes.
    pub fn data(&self) -> &[u8] {
        // SAFETY: a live read lease keeps the writer off the payload.
        let payload = unsafe { self.channel.payload(self.data_size + self.metadata_size) };
        &payload[..self.data_size.min(payload.len())]
    }

    /// The published metadata bytes.
    pub fn metadata(&self) -> &[u8] {
        // SAFETY: a live read lease keeps the writer off the payload.
        let payload = unsafe { self.channel.payload(self.data_size + self.metadata_size) };
        &payload[self.data_size.min(payload.len())..]
    }

    /// Acknowledge this version.
    pub fn release(mut self) -> MutableResult<()> {
        self.done = true;
        self.channel.read_commit(self.version)
    }
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        if !self.done {
            // Closed channels report Disconnected; nothing to do about it here.
            let _ = self.channel.read_commit(self.version);
        }
    }
}
