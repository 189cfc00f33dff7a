use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Identity of a client connection holding references into the store.
///
/// The transport assigns one `ClientId` per connection. Every reference a
/// client takes is attributed to it, so that tearing the connection down
/// can release everything it still holds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u64);

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

impl ClientId {
    /// Wrap a transport-assigned client number.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Allocate a process-unique client ID.
    pub fn next() -> Self {
        Self(NEXT_CLIENT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw client number.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_is_unique() {
        let a = ClientId::next();
        let b = ClientId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn display_format() {
        assert_eq!(ClientId::new(7).to_string(), "client-7");
        assert_eq!(ClientId::new(7).get(), 7);
    }
}
