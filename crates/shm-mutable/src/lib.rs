//! Mutable objects: payloads overwritten in place by one writer and observed
//! by a fixed set of readers.
//!
//! A mutable object (a *channel*) is created once with a fixed
//! `subscriber_count`. Each write publishes a new version; each subscriber
//! acknowledges the version it read. The writer may not overwrite the
//! payload until every subscriber has acknowledged the previous version.
//!
//! ```text
//! writer:  write_acquire ──▶ fill payload ──▶ write_release(sizes)  (version += 1)
//! readers:       read_acquire(last_seen) ──▶ read payload ──▶ read_release
//! ```
//!
//! Every wait is bounded by a timeout, and [`MutableObjectManager::close_channel`]
//! releases all waiters on a channel with [`MutableError::Disconnected`].

pub mod channel;
pub mod error;
pub mod header;
pub mod lease;
pub mod manager;

pub use channel::Channel;
pub use error::{MutableError, MutableResult};
pub use header::{MutableHeader, HEADER_LEN};
pub use lease::{ReadLease, WriteLease};
pub use manager::MutableObjectManager;
