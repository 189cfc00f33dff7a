//! The primary arena: one fixed-capacity mapping, sub-allocated first-fit.
//!
//! Free space is tracked as an offset-ordered map of free ranges. Freed
//! ranges are coalesced with their neighbours so that evicting whole
//! objects reclaims contiguous space. Accounting is in exact requested
//! bytes: there is no per-allocation header and no alignment padding.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use shm_types::Backing;
use tracing::{debug, info};

use crate::error::{AllocError, AllocResult};
use crate::region::MappedRegion;
use crate::traits::{Allocation, Allocator};

/// Free-list bookkeeping, guarded by the arena mutex.
#[derive(Debug, Default)]
struct FreeList {
    /// Free ranges: offset -> length. Adjacent ranges are always merged.
    free: BTreeMap<usize, usize>,
    /// Live allocations: offset -> length.
    allocated: HashMap<usize, usize>,
}

impl FreeList {
    fn with_capacity(capacity: usize) -> Self {
        let mut free = BTreeMap::new();
        free.insert(0, capacity);
        Self {
            free,
            allocated: HashMap::new(),
        }
    }

    /// First-fit: lowest-offset free range that can hold `size` bytes.
    fn take(&mut self, size: usize) -> Option<usize> {
        let (&offset, &len) = self.free.iter().find(|(_, &len)| len >= size)?;
        self.free.remove(&offset);
        if len > size {
            self.free.insert(offset + size, len - size);
        }
        self.allocated.insert(offset, size);
        Some(offset)
    }

    fn give_back(&mut self, offset: usize, len: usize) -> AllocResult<()> {
        match self.allocated.get(&offset) {
            None => {
                return Err(AllocError::InvalidState(format!(
                    "no live primary allocation at offset {offset} (double free?)"
                )))
            }
            Some(&live) if live != len => {
                return Err(AllocError::InvalidState(format!(
                    "allocation at offset {offset} is {live} bytes, handle says {len}"
                )))
            }
            Some(_) => {}
        }
        self.allocated.remove(&offset);

        let mut start = offset;
        let mut size = len;

        // Merge with the preceding free range if it ends where we begin.
        if let Some((&prev_off, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_off + prev_len == offset {
                self.free.remove(&prev_off);
                start = prev_off;
                size += prev_len;
            }
        }
        // Merge with the following free range if it begins where we end.
        if let Some(next_len) = self.free.remove(&(offset + len)) {
            size += next_len;
        }
        self.free.insert(start, size);
        Ok(())
    }

    fn largest_free(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }
}

/// Fixed-capacity shared arena with a first-fit free list.
pub struct PrimaryArena {
    region: Arc<MappedRegion>,
    capacity: usize,
    used: AtomicUsize,
    free_list: Mutex<FreeList>,
}

impl PrimaryArena {
    /// Create an arena over an anonymous shared mapping.
    pub fn anonymous(capacity: usize) -> AllocResult<Self> {
        let region = MappedRegion::anonymous(capacity)?;
        info!(capacity, "primary arena mapped (anonymous)");
        Ok(Self::over(region))
    }

    /// Create an arena over a file in `dir` (e.g. `/dev/shm`) so that other
    /// processes can map it.
    pub fn file_backed(dir: &Path, capacity: usize) -> AllocResult<Self> {
        std::fs::create_dir_all(dir)?;
        let region = MappedRegion::file_backed(dir, "shm-primary-", capacity)?;
        info!(capacity, dir = %dir.display(), "primary arena mapped (file-backed)");
        Ok(Self::over(region))
    }

    fn over(region: MappedRegion) -> Self {
        let capacity = region.len();
        Self {
            region: Arc::new(region),
            capacity,
            used: AtomicUsize::new(0),
            free_list: Mutex::new(FreeList::with_capacity(capacity)),
        }
    }

    /// Path of the arena's backing file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.region.path()
    }

    /// Size of the largest contiguous free range.
    pub fn largest_free_block(&self) -> usize {
        self.free_list
            .lock()
            .expect("arena lock poisoned")
            .largest_free()
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.free_list
            .lock()
            .expect("arena lock poisoned")
            .allocated
            .len()
    }
}

impl Allocator for PrimaryArena {
    fn allocate(&self, size: usize) -> AllocResult<Allocation> {
        if size == 0 {
            return Err(AllocError::InvalidState(
                "zero-byte allocation requested".into(),
            ));
        }
        let mut list = self.free_list.lock().expect("arena lock poisoned");
        let offset = list.take(size).ok_or_else(|| AllocError::OutOfMemory {
            requested: size,
            available: self.capacity - self.used.load(Ordering::Acquire),
        })?;
        self.used.fetch_add(size, Ordering::AcqRel);
        drop(list);

        debug!(offset, size, "primary allocate");
        Ok(Allocation {
            backing: Backing::Primary,
            key: offset as u64,
            offset,
            len: size,
            region: Arc::clone(&self.region),
        })
    }

    fn free(&self, allocation: &Allocation) -> AllocResult<()> {
        if allocation.backing != Backing::Primary
            || !Arc::ptr_eq(&allocation.region, &self.region)
        {
            return Err(AllocError::InvalidState(
                "allocation does not belong to this arena".into(),
            ));
        }
        let mut list = self.free_list.lock().expect("arena lock poisoned");
        list.give_back(allocation.offset, allocation.len)?;
        self.used.fetch_sub(allocation.len, Ordering::AcqRel);
        drop(list);

        debug!(offset = allocation.offset, size = allocation.len, "primary free");
        Ok(())
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for PrimaryArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryArena")
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .finish()
    }
}
