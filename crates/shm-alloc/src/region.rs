use std::fmt;
use std::io;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use tempfile::NamedTempFile;
use tracing::debug;

/// A contiguous shared mapping that allocations are carved from.
///
/// The region is either an anonymous shared mapping (inherited by forked
/// children) or a mapping of a file created in a caller-chosen directory,
/// which other processes can map by path. A file-backed region unlinks its
/// file when dropped.
///
/// Access to the bytes is `unsafe`: the region itself does no
/// synchronization. Callers (the object directory and the mutable channel
/// protocol) guarantee that a byte range is never written while it is read.
pub struct MappedRegion {
    ptr: *mut u8,
    len: usize,
    // Field order matters: the mapping drops before its file is unlinked.
    _map: MmapMut,
    file: Option<NamedTempFile>,
}

// SAFETY: the region is a plain byte mapping. Every accessor is `unsafe` and
// documents the aliasing contract callers must uphold.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of anonymous shared memory.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map a zero-length region",
            ));
        }
        let mut map = MmapOptions::new().len(len).map_anon()?;
        let ptr = map.as_mut_ptr();
        debug!(len, "mapped anonymous region");
        Ok(Self {
            ptr,
            len,
            _map: map,
            file: None,
        })
    }

    /// Create a `len`-byte file in `dir` and map it shared.
    pub fn file_backed(dir: &Path, prefix: &str, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map a zero-length region",
            ));
        }
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".shm")
            .tempfile_in(dir)?;
        file.as_file().set_len(len as u64)?;
        // SAFETY: the file was just created by us with a unique name and is
        // never truncated while mapped.
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(file.as_file())? };
        let ptr = map.as_mut_ptr();
        debug!(len, path = %file.path().display(), "mapped file-backed region");
        Ok(Self {
            ptr,
            len,
            _map: map,
            file: Some(file),
        })
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Regions are never empty; provided for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file, if the region is file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path())
    }

    /// Borrow `len` bytes starting at `offset`.
    ///
    /// # Safety
    ///
    /// `offset + len` must not exceed the region, and no thread may write
    /// the range for as long as the returned slice lives.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts(self.ptr.add(offset), len)
    }

    /// Mutably borrow `len` bytes starting at `offset`.
    ///
    /// # Safety
    ///
    /// `offset + len` must not exceed the region, and the caller must have
    /// exclusive access to the range for as long as the returned slice lives.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.add(offset), len)
    }

    /// Copy `src` into the region at `offset`.
    ///
    /// # Safety
    ///
    /// `offset + src.len()` must not exceed the region, and no other thread
    /// may read or write the destination range during the copy.
    pub unsafe fn copy_in(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.len);
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len());
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("len", &self.len)
            .field("path", &self.path())
            .finish()
    }
}
