//! The object directory: one record per live object.
//!
//! The directory is plain data behind `&mut self`. The lifecycle manager
//! wraps it, together with the eviction policy, in a single lock.
//!
//! Operations that remove a record hand it back to the caller. Dropping the
//! record returns its blocks to the allocator, so callers can do that after
//! releasing their lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use shm_alloc::{Allocator, Block};
use shm_types::{Backing, ClientId, ObjectId, ObjectState};
use tracing::debug;

use crate::buffer::{ObjectBuffer, Section};
use crate::error::{StoreError, StoreResult};

/// Parameters for a new object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateRequest {
    pub id: ObjectId,
    pub data_size: usize,
    pub metadata_size: usize,
    pub created_by: ClientId,
    /// Opaque tag naming the device the object is meant for.
    pub device_tag: u32,
}

impl CreateRequest {
    pub fn new(created_by: ClientId, id: ObjectId, data_size: usize) -> Self {
        Self {
            id,
            data_size,
            metadata_size: 0,
            created_by,
            device_tag: 0,
        }
    }

    pub fn with_metadata(mut self, metadata_size: usize) -> Self {
        self.metadata_size = metadata_size;
        self
    }

    pub fn on_device(mut self, device_tag: u32) -> Self {
        self.device_tag = device_tag;
        self
    }

    /// Data plus metadata bytes.
    pub fn total_size(&self) -> usize {
        self.data_size.saturating_add(self.metadata_size)
    }
}

/// Snapshot of a record for callers outside the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub state: ObjectState,
    pub data_size: usize,
    pub metadata_size: usize,
    pub ref_count: u32,
    pub created_by: ClientId,
    pub device_tag: u32,
    /// `None` for an object with no bytes at all.
    pub backing: Option<Backing>,
    pub created_at: SystemTime,
    pub sealed_at: Option<SystemTime>,
}

/// A live object and its bookkeeping.
#[derive(Debug)]
pub struct ObjectRecord {
    id: ObjectId,
    data: Option<Arc<Block>>,
    metadata: Option<Arc<Block>>,
    data_size: usize,
    metadata_size: usize,
    state: ObjectState,
    /// Hold count per client; `ref_count` is their sum.
    holders: HashMap<ClientId, u32>,
    ref_count: u32,
    created_by: ClientId,
    device_tag: u32,
    created_at: SystemTime,
    sealed_at: Option<SystemTime>,
    /// Copies into the unsealed object running outside the directory lock.
    writers: u32,
}

impl ObjectRecord {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// References held by `client`.
    pub fn holds(&self, client: ClientId) -> u32 {
        self.holders.get(&client).copied().unwrap_or(0)
    }

    /// Bytes the object occupies: data plus metadata.
    pub fn size(&self) -> usize {
        self.data_size + self.metadata_size
    }

    /// Backing of the object's bytes; data wins over metadata.
    pub fn backing(&self) -> Option<Backing> {
        self.data
            .as_ref()
            .or(self.metadata.as_ref())
            .map(|block| block.backing())
    }

    pub fn info(&self) -> ObjectInfo {
        ObjectInfo {
            id: self.id,
            state: self.state,
            data_size: self.data_size,
            metadata_size: self.metadata_size,
            ref_count: self.ref_count,
            created_by: self.created_by,
            device_tag: self.device_tag,
            backing: self.backing(),
            created_at: self.created_at,
            sealed_at: self.sealed_at,
        }
    }

    fn is_candidate(&self) -> bool {
        self.state == ObjectState::Evictable && self.ref_count == 0
    }

    /// Returns `true` while an [`ObjectBuffer`] or an in-flight write still
    /// shares one of the object's blocks. Removing a pinned record frees
    /// nothing until the pin drops.
    pub fn is_pinned(&self) -> bool {
        [&self.data, &self.metadata]
            .into_iter()
            .flatten()
            .any(|block| Arc::strong_count(block) > 1)
    }

    fn section(&self, section: Section) -> Option<&Arc<Block>> {
        match section {
            Section::Data => self.data.as_ref(),
            Section::Metadata => self.metadata.as_ref(),
        }
    }

    fn buffer(&self) -> ObjectBuffer {
        ObjectBuffer::new(self.id, self.data.clone(), self.metadata.clone())
    }
}

/// Outcome of dropping every hold a client owns.
#[derive(Debug, Default)]
pub struct ClientRelease {
    /// Objects that became eviction candidates, with their sizes.
    pub candidates: Vec<(ObjectId, usize)>,
    /// Unsealed objects the client created, now removed.
    pub aborted: Vec<ObjectRecord>,
    /// Total holds dropped.
    pub released: u32,
}

/// Map from object ID to record.
pub struct ObjectDirectory {
    allocator: Arc<dyn Allocator>,
    records: HashMap<ObjectId, ObjectRecord>,
}

impl ObjectDirectory {
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            allocator,
            records: HashMap::new(),
        }
    }

    /// Allocate an object and record it as `Created`, with one reference
    /// held by its creator.
    ///
    /// Allocation errors propagate unchanged and leave nothing behind.
    pub fn create_object(&mut self, request: &CreateRequest) -> StoreResult<ObjectInfo> {
        if self.records.contains_key(&request.id) {
            return Err(StoreError::ObjectExists(request.id));
        }
        let data = self.allocate_section(request.data_size)?;
        // On failure `data` drops here and its space goes back.
        let metadata = self.allocate_section(request.metadata_size)?;

        let record = ObjectRecord {
            id: request.id,
            data,
            metadata,
            data_size: request.data_size,
            metadata_size: request.metadata_size,
            state: ObjectState::Created,
            holders: HashMap::from([(request.created_by, 1)]),
            ref_count: 1,
            created_by: request.created_by,
            device_tag: request.device_tag,
            created_at: SystemTime::now(),
            sealed_at: None,
            writers: 0,
        };
        let info = record.info();
        debug!(
            id = %request.id,
            client = %request.created_by,
            size = record.size(),
            backing = ?info.backing,
            "object created"
        );
        self.records.insert(request.id, record);
        Ok(info)
    }

    /// Start a copy of `len` bytes at `offset` into an unsealed object.
    ///
    /// Returns the target block. Sealing is refused until the matching
    /// [`end_write`](Self::end_write).
    pub fn begin_write(
        &mut self,
        id: &ObjectId,
        section: Section,
        offset: usize,
        len: usize,
    ) -> StoreResult<Arc<Block>> {
        let record = self.record_mut(id)?;
        if record.state != ObjectState::Created {
            return Err(StoreError::InvalidState(format!(
                "object {id} is sealed and cannot be written"
            )));
        }
        let capacity = record.section(section).map_or(0, |b| b.len());
        let in_bounds = offset.checked_add(len).is_some_and(|end| end <= capacity);
        let block = match record.section(section) {
            Some(block) if in_bounds => Arc::clone(block),
            _ => {
                return Err(StoreError::InvalidState(format!(
                    "write of {len} bytes at {offset} exceeds the {capacity}-byte {section} of {id}"
                )))
            }
        };
        record.writers += 1;
        Ok(block)
    }

    /// Copy `bytes` into an unsealed object while holding `&mut self`.
    ///
    /// The lifecycle manager uses `begin_write`/`end_write` instead so the
    /// copy can run outside its lock.
    pub fn write(
        &mut self,
        id: &ObjectId,
        section: Section,
        offset: usize,
        bytes: &[u8],
    ) -> StoreResult<()> {
        let block = self.begin_write(id, section, offset, bytes.len())?;
        // SAFETY: the object is unsealed, so no view of the block exists,
        // and `&mut self` excludes every other writer.
        let copied = unsafe { block.allocation().write_at(offset, bytes) };
        self.end_write(id);
        Ok(copied?)
    }

    /// Finish a copy started with [`begin_write`](Self::begin_write).
    pub fn end_write(&mut self, id: &ObjectId) {
        if let Some(record) = self.records.get_mut(id) {
            record.writers = record.writers.saturating_sub(1);
        }
    }

    /// Make an object immutable and visible to readers.
    ///
    /// Returns the object's size if it is unreferenced and has just become
    /// an eviction candidate.
    pub fn seal_object(&mut self, id: &ObjectId) -> StoreResult<Option<usize>> {
        let record = self.record_mut(id)?;
        if record.state != ObjectState::Created {
            return Err(StoreError::InvalidState(format!("object {id} is already sealed")));
        }
        if record.writers > 0 {
            return Err(StoreError::InvalidState(format!(
                "object {id} has {} writes in flight",
                record.writers
            )));
        }
        record.sealed_at = Some(SystemTime::now());
        debug!(%id, ref_count = record.ref_count, "object sealed");
        if record.ref_count == 0 {
            record.state = ObjectState::Evictable;
            Ok(Some(record.size()))
        } else {
            record.state = ObjectState::Sealed;
            Ok(None)
        }
    }

    /// Take a reference to a sealed object on behalf of `client`.
    ///
    /// The flag is `true` when the object was an eviction candidate and no
    /// longer is.
    pub fn get(&mut self, client: ClientId, id: &ObjectId) -> StoreResult<(ObjectBuffer, bool)> {
        let record = self.record_mut(id)?;
        if !record.state.is_sealed() {
            return Err(StoreError::ObjectNotSealed(*id));
        }
        let was_candidate = record.state == ObjectState::Evictable;
        *record.holders.entry(client).or_insert(0) += 1;
        record.ref_count += 1;
        record.state = ObjectState::Sealed;
        debug!(%id, %client, ref_count = record.ref_count, "object referenced");
        Ok((record.buffer(), was_candidate))
    }

    /// Drop one of `client`'s references.
    ///
    /// Returns the object's size if it has just become an eviction
    /// candidate.
    pub fn release(&mut self, client: ClientId, id: &ObjectId) -> StoreResult<Option<usize>> {
        let record = self.record_mut(id)?;
        let Some(holds) = record.holders.get_mut(&client) else {
            return Err(StoreError::InvalidState(format!(
                "{client} holds no reference to {id}"
            )));
        };
        *holds -= 1;
        if *holds == 0 {
            record.holders.remove(&client);
        }
        record.ref_count -= 1;
        debug!(%id, %client, ref_count = record.ref_count, "object released");
        if record.ref_count == 0 && record.state == ObjectState::Sealed {
            record.state = ObjectState::Evictable;
            return Ok(Some(record.size()));
        }
        Ok(None)
    }

    /// Remove an unreferenced object.
    pub fn delete_object(&mut self, id: &ObjectId) -> StoreResult<ObjectRecord> {
        let record = self.record_mut(id)?;
        if record.ref_count != 0 {
            return Err(StoreError::InvalidState(format!(
                "object {id} still has {} references",
                record.ref_count
            )));
        }
        if record.writers > 0 {
            return Err(StoreError::InvalidState(format!(
                "object {id} has writes in flight"
            )));
        }
        debug!(%id, "object deleted");
        self.remove(id)
    }

    /// Discard an unsealed object on behalf of its creator.
    pub fn abort(&mut self, client: ClientId, id: &ObjectId) -> StoreResult<ObjectRecord> {
        let record = self.record_mut(id)?;
        if record.state != ObjectState::Created {
            return Err(StoreError::InvalidState(format!(
                "object {id} is sealed and cannot be aborted"
            )));
        }
        if record.created_by != client {
            return Err(StoreError::InvalidState(format!(
                "{client} did not create {id}"
            )));
        }
        if record.writers > 0 {
            return Err(StoreError::InvalidState(format!(
                "object {id} has writes in flight"
            )));
        }
        debug!(%id, %client, "object aborted");
        self.remove(id)
    }

    /// Remove `id` if it is still an unreferenced sealed object whose bytes
    /// no view pins.
    ///
    /// `None` means the victim went away, was referenced again since it was
    /// selected, or is still pinned by a view.
    pub fn evict(&mut self, id: &ObjectId) -> Option<ObjectRecord> {
        let evictable = self
            .records
            .get(id)
            .is_some_and(|r| r.is_candidate() && !r.is_pinned());
        if !evictable {
            return None;
        }
        self.records.remove(id)
    }

    /// Drop every reference `client` holds and abort the unsealed objects it
    /// created.
    pub fn release_client(&mut self, client: ClientId) -> ClientRelease {
        let mut out = ClientRelease::default();
        let mut ids: Vec<ObjectId> = self
            .records
            .values()
            .filter(|r| r.holders.contains_key(&client) || r.created_by == client)
            .map(|r| r.id)
            .collect();
        ids.sort();

        for id in ids {
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            if let Some(holds) = record.holders.remove(&client) {
                record.ref_count -= holds;
                out.released += holds;
            }
            match record.state {
                ObjectState::Created if record.created_by == client => {
                    if let Some(record) = self.records.remove(&id) {
                        out.aborted.push(record);
                    }
                }
                ObjectState::Sealed if record.ref_count == 0 => {
                    record.state = ObjectState::Evictable;
                    out.candidates.push((id, record.size()));
                }
                _ => {}
            }
        }
        debug!(
            %client,
            released = out.released,
            aborted = out.aborted.len(),
            "client references dropped"
        );
        out
    }

    /// Returns `true` if `id` names a sealed object.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.records.get(id).is_some_and(|r| r.state.is_sealed())
    }

    pub fn record(&self, id: &ObjectId) -> Option<&ObjectRecord> {
        self.records.get(id)
    }

    pub fn info(&self, id: &ObjectId) -> Option<ObjectInfo> {
        self.records.get(id).map(ObjectRecord::info)
    }

    /// Every record, ordered by ID.
    pub fn list(&self) -> Vec<ObjectInfo> {
        let mut infos: Vec<ObjectInfo> = self.records.values().map(ObjectRecord::info).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn allocate_section(&self, size: usize) -> StoreResult<Option<Arc<Block>>> {
        if size == 0 {
            return Ok(None);
        }
        let block = Block::allocate(&self.allocator, size)?;
        Ok(Some(Arc::new(block)))
    }

    fn record_mut(&mut self, id: &ObjectId) -> StoreResult<&mut ObjectRecord> {
        self.records
            .get_mut(id)
            .ok_or(StoreError::ObjectNotFound(*id))
    }

    fn remove(&mut self, id: &ObjectId) -> StoreResult<ObjectRecord> {
        self.records
            .remove(id)
            .ok_or(StoreError::ObjectNotFound(*id))
    }
}

impl std::fmt::Debug for ObjectDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDirectory")
            .field("objects", &self.records.len())
            .finish()
    }
}
