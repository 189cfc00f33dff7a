use shm_types::Backing;
use tracing::debug;

use crate::arena::PrimaryArena;
use crate::error::{AllocError, AllocResult};
use crate::fallback::FallbackAllocator;
use crate::traits::{Allocation, Allocator};

/// Primary-then-fallback composite allocator.
///
/// Requests larger than `max_allocation` are refused up front with
/// [`AllocError::TooLarge`]. Otherwise the primary arena is tried first; if
/// it is out of space the request goes to the fallback allocator. The
/// returned handle's [`backing`](Allocation::backing) says which one served
/// it, and [`free`](Allocator::free) dispatches on that tag.
#[derive(Debug)]
pub struct TieredAllocator {
    primary: PrimaryArena,
    fallback: FallbackAllocator,
    max_allocation: usize,
}

impl TieredAllocator {
    /// Compose a primary arena and a fallback allocator.
    pub fn new(primary: PrimaryArena, fallback: FallbackAllocator, max_allocation: usize) -> Self {
        Self {
            primary,
            fallback,
            max_allocation,
        }
    }

    /// The primary arena.
    pub fn primary(&self) -> &PrimaryArena {
        &self.primary
    }

    /// The fallback allocator.
    pub fn fallback(&self) -> &FallbackAllocator {
        &self.fallback
    }

    /// Largest request this allocator will consider.
    pub fn max_allocation(&self) -> usize {
        self.max_allocation
    }
}

impl Allocator for TieredAllocator {
    fn allocate(&self, size: usize) -> AllocResult<Allocation> {
        if size > self.max_allocation {
            return Err(AllocError::TooLarge {
                requested: size,
                max: self.max_allocation,
            });
        }
        match self.primary.allocate(size) {
            Err(AllocError::OutOfMemory { .. }) => {}
            other => return other,
        }
        match self.fallback.allocate(size) {
            Ok(allocation) => {
                debug!(size, "primary exhausted; served from fallback");
                Ok(allocation)
            }
            Err(AllocError::OutOfMemory { .. }) => Err(AllocError::OutOfMemory {
                requested: size,
                available: self.available(),
            }),
            Err(e) => Err(e),
        }
    }

    fn free(&self, allocation: &Allocation) -> AllocResult<()> {
        match allocation.backing() {
            Backing::Primary => self.primary.free(allocation),
            Backing::Fallback => self.fallback.free(allocation),
        }
    }

    fn used(&self) -> usize {
        self.primary.used() + self.fallback.used()
    }

    fn capacity(&self) -> usize {
        self.primary.capacity() + self.fallback.capacity()
    }
}
