//! Shared-memory allocation for the object store.
//!
//! Space comes from two regions:
//!
//! - [`PrimaryArena`] -- one fixed-capacity mapping sub-allocated first-fit
//!   from an offset-ordered free list.
//! - [`FallbackAllocator`] -- one standalone disk-backed mapping per
//!   allocation, bounded by its own capacity ceiling.
//!
//! [`TieredAllocator`] composes the two behind the [`Allocator`] trait,
//! trying primary first and falling back when it is exhausted. Every
//! [`Allocation`] records which [`Backing`](shm_types::Backing) served it.
//!
//! # Design Rules
//!
//! 1. `used() <= capacity()` for every allocator, at all times.
//! 2. Freeing a handle twice, or a handle from another allocator, is an
//!    error. Nothing is silently ignored.
//! 3. Mapped memory outlives its handle: a region is unmapped only after
//!    the last [`Allocation`] clone referencing it drops.
//! 4. The allocator never interprets the bytes it hands out.

pub mod arena;
pub mod block;
pub mod error;
pub mod fallback;
pub mod region;
pub mod tiered;
pub mod traits;

pub use arena::PrimaryArena;
pub use block::Block;
pub use error::{AllocError, AllocResult};
pub use fallback::FallbackAllocator;
pub use region::MappedRegion;
pub use tiered::TieredAllocator;
pub use traits::{Allocation, Allocator};
