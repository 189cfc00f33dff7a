//! Disk-backed fallback allocations.
//!
//! Each allocation is its own temp file in the fallback directory, sized to
//! the request and mapped shared. Nothing is sub-allocated, so a free is a
//! table removal; the mapping is torn down and the file unlinked once the
//! last handle to it drops.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use shm_types::Backing;
use tracing::{debug, info};

use crate::error::{AllocError, AllocResult};
use crate::region::MappedRegion;
use crate::traits::{Allocation, Allocator};

/// Allocator that serves each request from a standalone file mapping.
pub struct FallbackAllocator {
    dir: Option<PathBuf>,
    capacity: usize,
    used: AtomicUsize,
    next_key: AtomicU64,
    live: Mutex<HashMap<u64, Arc<MappedRegion>>>,
}

impl FallbackAllocator {
    /// Create a fallback allocator writing into `dir`, bounded by `capacity`
    /// bytes of live allocations. The directory is created if missing.
    pub fn new(dir: &Path, capacity: usize) -> AllocResult<Self> {
        std::fs::create_dir_all(dir)?;
        info!(capacity, dir = %dir.display(), "fallback allocator ready");
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            capacity,
            used: AtomicUsize::new(0),
            next_key: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        })
    }

    /// A fallback allocator that refuses every request.
    pub fn disabled() -> Self {
        Self {
            dir: None,
            capacity: 0,
            used: AtomicUsize::new(0),
            next_key: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if this allocator can serve requests at all.
    pub fn is_enabled(&self) -> bool {
        self.dir.is_some() && self.capacity > 0
    }

    /// Directory fallback files are created in.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Number of live fallback allocations.
    pub fn allocation_count(&self) -> usize {
        self.live.lock().expect("fallback lock poisoned").len()
    }

    /// Reserve `size` bytes against the ceiling, or report how much is left.
    fn reserve(&self, size: usize) -> AllocResult<()> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current
                .checked_add(size)
                .filter(|n| *n <= self.capacity)
                .ok_or(AllocError::OutOfMemory {
                    requested: size,
                    available: self.capacity - current,
                })?;
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }
}

impl Allocator for FallbackAllocator {
    fn allocate(&self, size: usize) -> AllocResult<Allocation> {
        if size == 0 {
            return Err(AllocError::InvalidState(
                "zero-byte allocation requested".into(),
            ));
        }
        let Some(dir) = self.dir.as_deref() else {
            return Err(AllocError::OutOfMemory {
                requested: size,
                available: 0,
            });
        };
        self.reserve(size)?;

        let region = match MappedRegion::file_backed(dir, "shm-fallback-", size) {
            Ok(region) => Arc::new(region),
            Err(e) => {
                self.used.fetch_sub(size, Ordering::AcqRel);
                return Err(e.into());
            }
        };
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.live
            .lock()
            .expect("fallback lock poisoned")
            .insert(key, Arc::clone(&region));

        debug!(key, size, "fallback allocate");
        Ok(Allocation {
            backing: Backing::Fallback,
            key,
            offset: 0,
            len: size,
            region,
        })
    }

    fn free(&self, allocation: &Allocation) -> AllocResult<()> {
        if allocation.backing != Backing::Fallback {
            return Err(AllocError::InvalidState(
                "allocation does not belong to the fallback allocator".into(),
            ));
        }
        let mut live = self.live.lock().expect("fallback lock poisoned");
        match live.get(&allocation.key) {
            Some(region) if Arc::ptr_eq(region, &allocation.region) => {}
            _ => {
                return Err(AllocError::InvalidState(format!(
                    "no live fallback allocation with key {} (double free?)",
                    allocation.key
                )))
            }
        }
        live.remove(&allocation.key);
        self.used.fetch_sub(allocation.len, Ordering::AcqRel);
        drop(live);

        debug!(key = allocation.key, size = allocation.len, "fallback free");
        Ok(())
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for FallbackAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackAllocator")
            .field("dir", &self.dir)
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .finish()
    }
}
