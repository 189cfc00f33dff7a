use std::fmt;

use serde::{Deserialize, Serialize};

/// The memory region that served an allocation.
///
/// Purely an accounting tag: object contents look the same regardless of
/// which backing holds them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backing {
    /// The fixed-capacity shared arena.
    Primary,
    /// A standalone disk-backed mapping in the fallback directory.
    Fallback,
}

impl fmt::Display for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

/// Lifecycle state of an immutable object.
///
/// ```text
/// Created ──seal──▶ Sealed ◀──ref_count crosses 0──▶ Evictable ──▶ (deleted)
///    └──────────────abort──────────────────────────────────────────▶ (deleted)
/// ```
///
/// There is no `Deleted` variant: a deleted object has no record at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectState {
    /// Allocated, being written by its creator. Not visible to readers.
    Created,
    /// Immutable and referenced by at least one client.
    Sealed,
    /// Immutable and unreferenced; an eviction candidate.
    Evictable,
}

impl ObjectState {
    /// Returns `true` once the object's contents are immutable.
    pub fn is_sealed(&self) -> bool {
        matches!(self, Self::Sealed | Self::Evictable)
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Sealed => f.write_str("sealed"),
            Self::Evictable => f.write_str("evictable"),
        }
    }
}
