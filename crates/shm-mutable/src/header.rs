/// Size of the header at the start of every channel allocation.
pub const HEADER_LEN: usize = 40;

const FLAG_CLOSED: u32 = 1;

/// Channel header as laid out in shared memory.
///
/// ```text
/// [ 0..8 ] version              u64 LE
/// [ 8..16] data_size            u64 LE
/// [16..24] metadata_size        u64 LE
/// [24..28] outstanding_readers  u32 LE
/// [28..32] subscriber_count     u32 LE
/// [32..36] flags                u32 LE  (bit 0: closed)
/// [36..40] reserved
/// ```
///
/// The layout is private to this store version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MutableHeader {
    pub version: u64,
    pub data_size: u64,
    pub metadata_size: u64,
    pub outstanding_readers: u32,
    pub subscriber_count: u32,
    pub closed: bool,
}

impl MutableHeader {
    /// Serialize into the on-region layout.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.data_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.metadata_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.outstanding_readers.to_le_bytes());
        buf[28..32].copy_from_slice(&self.subscriber_count.to_le_bytes());
        let flags = if self.closed { FLAG_CLOSED } else { 0 };
        buf[32..36].copy_from_slice(&flags.to_le_bytes());
        buf
    }

    /// Parse the on-region layout. Returns `None` if `buf` is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let u32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[at..at + 4]);
            u32::from_le_bytes(b)
        };
        Some(Self {
            version: u64_at(0),
            data_size: u64_at(8),
            metadata_size: u64_at(16),
            outstanding_readers: u32_at(24),
            subscriber_count: u32_at(28),
            closed: u32_at(32) & FLAG_CLOSED != 0,
        })
    }
}
