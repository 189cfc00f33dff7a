use std::time::Duration;

use shm_alloc::AllocError;
use shm_mutable::MutableError;
use shm_types::ObjectId;

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No live object has this ID.
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// A live object already has this ID.
    #[error("object already exists: {0}")]
    ObjectExists(ObjectId),

    /// The object exists but its creator has not sealed it yet.
    #[error("object not sealed: {0}")]
    ObjectNotSealed(ObjectId),

    /// Eviction could not make room for a new object.
    #[error("object store full: cannot fit {requested} bytes for {id}")]
    ObjectStoreFull { id: ObjectId, requested: usize },

    /// The allocator could not satisfy a request.
    #[error("out of memory: {0}")]
    OutOfMemory(AllocError),

    /// Illegal state transition: double seal, delete while referenced,
    /// release without a reference, double free.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A mutable-object wait expired.
    #[error("timed out after {waited:?} waiting on {id}")]
    Timeout { id: ObjectId, waited: Duration },

    /// A mutable object's peer was torn down.
    #[error("mutable object {0} disconnected")]
    Disconnected(ObjectId),

    /// Mapping or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Returns `true` for errors caused by a lack of space.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::OutOfMemory(_) | Self::ObjectStoreFull { .. })
    }
}

impl From<AllocError> for StoreError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfMemory { .. } | AllocError::TooLarge { .. } => Self::OutOfMemory(err),
            AllocError::InvalidState(msg) => Self::InvalidState(msg),
            AllocError::OutOfBounds { .. } => Self::InvalidState(err.to_string()),
            AllocError::Io(e) => Self::Io(e),
        }
    }
}

impl From<MutableError> for StoreError {
    fn from(err: MutableError) -> Self {
        match err {
            MutableError::ObjectNotFound(id) => Self::ObjectNotFound(id),
            MutableError::ObjectExists(id) => Self::ObjectExists(id),
            MutableError::InvalidState(msg) => Self::InvalidState(msg),
            MutableError::Timeout { id, waited } => Self::Timeout { id, waited },
            MutableError::Disconnected(id) => Self::Disconnected(id),
            MutableError::Alloc(e) => e.into(),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
