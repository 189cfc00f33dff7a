use std::time::Duration;

use shm_alloc::AllocError;
use shm_types::ObjectId;

/// Errors from mutable-object operations.
#[derive(Debug, thiserror::Error)]
pub enum MutableError {
    /// No channel with this ID exists.
    #[error("mutable object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// A channel with this ID already exists.
    #[error("mutable object already exists: {0}")]
    ObjectExists(ObjectId),

    /// The request violates the channel protocol.
    #[error("invalid mutable object state: {0}")]
    InvalidState(String),

    /// The wait for a new version or a free writer slot expired.
    #[error("timed out after {waited:?} waiting on {id}")]
    Timeout { id: ObjectId, waited: Duration },

    /// The channel was closed while the caller waited or held a lease.
    #[error("mutable object {0} disconnected")]
    Disconnected(ObjectId),

    /// Allocating the channel's payload failed.
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Result alias for mutable-object operations.
pub type MutableResult<T> = Result<T, MutableError>;
