//! Foundation types for the shared-memory object store.
//!
//! Every other crate in the workspace depends on `shm-types`.
//!
//! # Key Types
//!
//! - [`ObjectId`] — Fixed-width, caller-supplied object identifier
//! - [`ClientId`] — Identity of a connected client holding references
//! - [`Backing`] — Which memory region served an allocation
//! - [`ObjectState`] — Lifecycle state of an immutable object

pub mod client;
pub mod error;
pub mod object;
pub mod state;

pub use client::ClientId;
pub use error::TypeError;
pub use object::{ObjectId, OBJECT_ID_LEN};
pub use state::{Backing, ObjectState};
