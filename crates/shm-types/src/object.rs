use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Width of an [`ObjectId`] in bytes.
pub const OBJECT_ID_LEN: usize = 20;

/// Opaque identifier for an object held by the store.
///
/// IDs are chosen by the caller; the store never derives them from content.
/// An ID is unique among live objects only: once an object is deleted its ID
/// may be reused for a new object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// Wrap raw identifier bytes.
    pub const fn from_raw(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// The all-zero ID. Never assigned by [`ObjectId::random`].
    pub const fn nil() -> Self {
        Self([0u8; OBJECT_ID_LEN])
    }

    /// Returns `true` if this is the all-zero ID.
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; OBJECT_ID_LEN]
    }

    /// A fresh random ID.
    pub fn random() -> Self {
        loop {
            let mut bytes = [0u8; OBJECT_ID_LEN];
            rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
            let id = Self(bytes);
            if !id.is_nil() {
                return id;
            }
        }
    }

    /// Derive an ID from arbitrary bytes (BLAKE3, truncated).
    ///
    /// A convenience for callers that want deterministic IDs, e.g. in tests
    /// or when keying objects by name.
    pub fn digest(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        let mut bytes = [0u8; OBJECT_ID_LEN];
        bytes.copy_from_slice(&hash.as_bytes()[..OBJECT_ID_LEN]);
        Self(bytes)
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::try_from(bytes.as_slice())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; OBJECT_ID_LEN]> for ObjectId {
    fn from(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for ObjectId {
    type Error = TypeError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; OBJECT_ID_LEN] =
            bytes.try_into().map_err(|_| TypeError::InvalidLength {
                expected: OBJECT_ID_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(ObjectId::digest(b"hello"), ObjectId::digest(b"hello"));
        assert_ne!(ObjectId::digest(b"hello"), ObjectId::digest(b"world"));
    }

    #[test]
    fn random_ids_are_not_nil() {
        for _ in 0..32 {
            assert!(!ObjectId::random().is_nil());
        }
    }

    #[test]
    fn nil_is_all_zeros() {
        assert!(ObjectId::nil().is_nil());
        assert_eq!(ObjectId::nil().as_bytes(), &[0u8; OBJECT_ID_LEN]);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        let err = ObjectId::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: OBJECT_ID_LEN,
                actual: 2
            }
        );
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(matches!(
            ObjectId::from_hex("not hex"),
            Err(TypeError::InvalidHex(_))
        ));
    }

    #[test]
    fn display_is_full_hex() {
        let id = ObjectId::digest(b"display");
        let shown = format!("{id}");
        assert_eq!(shown.len(), OBJECT_ID_LEN * 2);
        assert_eq!(ObjectId::from_hex(&shown).unwrap(), id);
    }

    #[test]
    fn debug_uses_short_hex() {
        let id = ObjectId::digest(b"debug");
        assert_eq!(format!("{id:?}"), format!("ObjectId({})", id.short_hex()));
    }

    #[test]
    fn serde_json_roundtrip() {
        let id = ObjectId::digest(b"serde");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(serde_json::from_str::<ObjectId>(&json).unwrap(), id);
    }

    proptest! {
        #[test]
        fn hex_parse_accepts_any_id(bytes in proptest::array::uniform20(any::<u8>())) {
            let id = ObjectId::from_raw(bytes);
            prop_assert_eq!(ObjectId::from_hex(&id.to_hex()).unwrap(), id);
        }
    }
}
