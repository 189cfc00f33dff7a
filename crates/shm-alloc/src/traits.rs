use std::fmt;
use std::path::Path;
use std::sync::Arc;

use shm_types::Backing;

use crate::error::{AllocError, AllocResult};
use crate::region::MappedRegion;

/// Handle to a byte range handed out by an [`Allocator`].
///
/// A handle names its backing, its offset within the backing region and its
/// length. It also keeps the region mapped: the memory a handle points at
/// stays valid until every clone of the handle is gone, even after the
/// range has been freed.
#[derive(Clone)]
pub struct Allocation {
    pub(crate) backing: Backing,
    pub(crate) key: u64,
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) region: Arc<MappedRegion>,
}

impl Allocation {
    /// Which region served this allocation.
    pub fn backing(&self) -> Backing {
        self.backing
    }

    /// Offset of the range within its region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the range in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for a zero-length range (never produced by the
    /// allocators in this crate).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the file backing the region, if any. A transport hands this
    /// and [`offset`](Self::offset) to clients that map the region
    /// themselves.
    pub fn region_path(&self) -> Option<&Path> {
        self.region.path()
    }

    /// Returns `true` if both handles name the same range of the same region.
    pub fn same_range(&self, other: &Allocation) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
            && self.offset == other.offset
            && self.len == other.len
    }

    /// Borrow the allocated bytes.
    ///
    /// # Safety
    ///
    /// No thread may write the range while the returned slice lives.
    pub unsafe fn bytes(&self) -> &[u8] {
        self.region.slice(self.offset, self.len)
    }

    /// Borrow `len` bytes at `at` within the allocation.
    ///
    /// # Safety
    ///
    /// No thread may write the range while the returned slice lives.
    pub unsafe fn bytes_at(&self, at: usize, len: usize) -> AllocResult<&[u8]> {
        self.check_bounds(at, len)?;
        Ok(self.region.slice(self.offset + at, len))
    }

    /// Mutably borrow `len` bytes at `at` within the allocation.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the range while the
    /// returned slice lives.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut_at(&self, at: usize, len: usize) -> AllocResult<&mut [u8]> {
        self.check_bounds(at, len)?;
        Ok(self.region.slice_mut(self.offset + at, len))
    }

    /// Copy `src` into the allocation starting at `at`.
    ///
    /// # Safety
    ///
    /// No other thread may read or write the destination range during the
    /// copy.
    pub unsafe fn write_at(&self, at: usize, src: &[u8]) -> AllocResult<()> {
        self.check_bounds(at, src.len())?;
        self.region.copy_in(self.offset + at, src);
        Ok(())
    }

    fn check_bounds(&self, at: usize, len: usize) -> AllocResult<()> {
        match at.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(AllocError::OutOfBounds {
                offset: at,
                len,
                capacity: self.len,
            }),
        }
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("backing", &self.backing)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Raw byte-range allocation over a shared region.
///
/// Implementations must satisfy:
/// - `used() <= capacity()` at all times; both change atomically with each
///   successful `allocate`/`free`.
/// - `free` of a handle this allocator did not produce, or already freed,
///   fails with [`AllocError::InvalidState`].
/// - A zero-byte request fails with [`AllocError::InvalidState`].
pub trait Allocator: Send + Sync {
    /// Allocate `size` bytes.
    fn allocate(&self, size: usize) -> AllocResult<Allocation>;

    /// Return an allocation's range to the region it came from.
    fn free(&self, allocation: &Allocation) -> AllocResult<()>;

    /// Bytes currently allocated.
    fn used(&self) -> usize;

    /// Total bytes this allocator can hand out.
    fn capacity(&self) -> usize;

    /// Bytes still available. Fragmentation may prevent a single request of
    /// this size from succeeding.
    fn available(&self) -> usize {
        self.capacity().saturating_sub(self.used())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(len: usize) -> Allocation {
        Allocation {
            backing: Backing::Primary,
            key: 0,
            offset: 8,
            len,
            region: Arc::new(MappedRegion::anonymous(64).unwrap()),
        }
    }

    #[test]
    fn write_and_read_within_bounds() {
        let a = handle(16);
        unsafe {
            a.write_at(4, b"data").unwrap();
            assert_eq!(a.bytes_at(4, 4).unwrap(), b"data");
            assert_eq!(a.bytes().len(), 16);
        }
    }

    #[test]
    fn write_past_end_is_rejected() {
        let a = handle(16);
        let err = unsafe { a.write_at(14, b"data") }.unwrap_err();
        assert!(matches!(
            err,
            AllocError::OutOfBounds {
                offset: 14,
                len: 4,
                capacity: 16
            }
        ));
    }

    #[test]
    fn overflowing_offset_is_rejected() {
        let a = handle(16);
        assert!(unsafe { a.bytes_at(usize::MAX, 2) }.is_err());
    }

    #[test]
    fn same_range_compares_region_identity() {
        let a = handle(16);
        let b = a.clone();
        let c = handle(16);
        assert!(a.same_range(&b));
        assert!(!a.same_range(&c));
    }
}
