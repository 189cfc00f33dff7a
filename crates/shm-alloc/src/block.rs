use std::fmt;
use std::sync::Arc;

use shm_types::Backing;
use tracing::warn;

use crate::error::AllocResult;
use crate::traits::{Allocation, Allocator};

/// An allocation that returns itself to its allocator when dropped.
///
/// Owners share a block through `Arc<Block>`: the range goes back to the
/// allocator only after the last holder is gone, so a zero-copy view can
/// never observe its bytes being reused.
pub struct Block {
    allocation: Allocation,
    allocator: Arc<dyn Allocator>,
}

impl Block {
    /// Allocate `size` bytes from `allocator`.
    pub fn allocate(allocator: &Arc<dyn Allocator>, size: usize) -> AllocResult<Self> {
        let allocation = allocator.allocate(size)?;
        Ok(Self {
            allocation,
            allocator: Arc::clone(allocator),
        })
    }

    /// The underlying allocation handle.
    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// Which region holds this block.
    pub fn backing(&self) -> Backing {
        self.allocation.backing()
    }

    /// Size of the block in bytes.
    pub fn len(&self) -> usize {
        self.allocation.len()
    }

    /// Returns `true` for a zero-length block.
    pub fn is_empty(&self) -> bool {
        self.allocation.is_empty()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.free(&self.allocation) {
            warn!(error = %e, backing = %self.allocation.backing(), "failed to free block");
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("allocation", &self.allocation)
            .finish()
    }
}
