use std::fmt;
use std::path::Path;
use std::sync::Arc;

use shm_alloc::Block;
use shm_types::{Backing, ObjectId};

/// Which half of an object a write targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Section {
    Data,
    Metadata,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => f.write_str("data"),
            Self::Metadata => f.write_str("metadata"),
        }
    }
}

/// Read-only, zero-copy view of a sealed object.
///
/// The view shares ownership of the object's blocks, so the bytes stay
/// mapped even if the object is deleted or evicted while the view lives.
/// Holding a view is not a reference in the store's sense: release the
/// reference you took with `get` as usual.
#[derive(Clone)]
pub struct ObjectBuffer {
    id: ObjectId,
    data: Option<Arc<Block>>,
    metadata: Option<Arc<Block>>,
}

impl ObjectBuffer {
    pub(crate) fn new(id: ObjectId, data: Option<Arc<Block>>, metadata: Option<Arc<Block>>) -> Self {
        Self { id, data, metadata }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The object's data bytes.
    pub fn data(&self) -> &[u8] {
        sealed_bytes(&self.data)
    }

    /// The object's metadata bytes.
    pub fn metadata(&self) -> &[u8] {
        sealed_bytes(&self.metadata)
    }

    pub fn data_size(&self) -> usize {
        self.data.as_ref().map_or(0, |b| b.len())
    }

    pub fn metadata_size(&self) -> usize {
        self.metadata.as_ref().map_or(0, |b| b.len())
    }

    /// Where the data lives, for handing to another process.
    pub fn data_location(&self) -> Option<BufferLocation<'_>> {
        self.data.as_deref().map(BufferLocation::of)
    }

    /// Where the metadata lives, for handing to another process.
    pub fn metadata_location(&self) -> Option<BufferLocation<'_>> {
        self.metadata.as_deref().map(BufferLocation::of)
    }
}

impl fmt::Debug for ObjectBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBuffer")
            .field("id", &self.id)
            .field("data_size", &self.data_size())
            .field("metadata_size", &self.metadata_size())
            .finish()
    }
}

/// Mapping coordinates of one section: the backing file (if any) and the
/// byte range within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLocation<'a> {
    pub backing: Backing,
    pub path: Option<&'a Path>,
    pub offset: usize,
    pub len: usize,
}

impl<'a> BufferLocation<'a> {
    fn of(block: &'a Block) -> Self {
        let allocation = block.allocation();
        Self {
            backing: allocation.backing(),
            path: allocation.region_path(),
            offset: allocation.offset(),
            len: allocation.len(),
        }
    }
}

fn sealed_bytes(block: &Option<Arc<Block>>) -> &[u8] {
    match block {
        // SAFETY: views are only handed out for sealed objects, and sealed
        // blocks are never written again.
        Some(block) => unsafe { block.allocation().bytes() },
        None => &[],
    }
}
