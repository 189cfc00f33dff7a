use std::io;

/// Errors from allocator operations.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// No region could satisfy the request.
    #[error("out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// The request exceeds the maximum single allocation size.
    #[error("allocation of {requested} bytes exceeds the {max}-byte maximum")]
    TooLarge { requested: usize, max: usize },

    /// Illegal operation: double free, foreign handle, zero-byte request.
    #[error("invalid allocator state: {0}")]
    InvalidState(String),

    /// A read or write reached past the end of an allocation.
    #[error("access out of bounds: offset {offset} + {len} bytes exceeds {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    /// Creating or mapping backing memory failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AllocError {
    /// Returns `true` for errors caused by a lack of space.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. } | Self::TooLarge { .. })
    }
}

/// Result alias for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;
