//! Shared-memory object store.
//!
//! [`ObjectStore`] ties the pieces together:
//!
//! - [`ObjectDirectory`] -- one record per live object, with per-client
//!   reference holds and the `Created -> Sealed <-> Evictable` state machine.
//! - [`EvictionPolicy`] -- unreferenced sealed objects, oldest release
//!   first.
//! - [`MutableObjectManager`](shm_mutable::MutableObjectManager) --
//!   versioned single-writer channels sharing the store's allocator.
//! - [`StoreStats`] -- passive counters, read through [`StatsSnapshot`].
//!
//! # Design Rules
//!
//! 1. A referenced object is never evicted. Victims are re-checked under
//!    the lock immediately before removal.
//! 2. A failed create leaves no record and no allocation behind.
//! 3. Sealed bytes never change. Readers get zero-copy views that keep the
//!    bytes mapped for as long as the view lives.
//! 4. Creation evicts and retries at most once.

pub mod buffer;
pub mod config;
pub mod directory;
pub mod error;
pub mod eviction;
pub mod stats;
pub mod store;

pub use buffer::{BufferLocation, ObjectBuffer, Section};
pub use config::StoreConfig;
pub use directory::{ClientRelease, CreateRequest, ObjectDirectory, ObjectInfo, ObjectRecord};
pub use error::{StoreError, StoreResult};
pub use eviction::EvictionPolicy;
pub use stats::{StatsSnapshot, StoreStats};
pub use store::{DisconnectReport, EvictionReport, ObjectStore};
