//! The arena header at offset 0.
//!
//! ```text
//!  0  magic        fixed/growable tag, low bit = small blocks enabled
//!  4  message      offset of the root message
//!  8  hwm          one past the highest byte ever allocated
//! 12  full_size    total capacity
//! 16  free_list    offset of the first free block
//! 20  metadata     offset of out-of-band metadata
//! 24  bitmaps[4]   per size class, offset of the run registry
//! ```
//!
//! All fields are little-endian `u32`s.

use crate::bitmap::NUM_SIZE_CLASSES;
use crate::error::ArenaError;
use crate::offset::{Offset, Scalar};

/// Magic for an arena over fixed, caller-owned memory.
pub const FIXED_MAGIC: u32 = 0xe5f6f1c4;

/// Magic for an arena that may relocate through a growth strategy.
pub const MOVEABLE_MAGIC: u32 = 0xc5f6f1c4;

/// Low bit of the magic: the small-block allocator is enabled.
pub const SMALL_BLOCK_FLAG: u32 = 1;

const MAGIC_MASK: u32 = !SMALL_BLOCK_FLAG;

pub(crate) const MAGIC_AT: u32 = 0;
pub(crate) const MESSAGE_AT: u32 = 4;
pub(crate) const HWM_AT: u32 = 8;
pub(crate) const FULL_SIZE_AT: u32 = 12;
pub(crate) const FREE_LIST_AT: u32 = 16;
pub(crate) const METADATA_AT: u32 = 20;
pub(crate) const BITMAPS_AT: u32 = 24;

/// Size of the header in bytes. The first free block starts here.
pub const HEADER_SIZE: u32 = BITMAPS_AT + 4 * NUM_SIZE_CLASSES as u32;

/// Whether `magic` is one of the two arena tags (ignoring the flag bit).
pub fn is_valid_magic(magic: u32) -> bool {
    let m = magic & MAGIC_MASK;
    m == FIXED_MAGIC || m == MOVEABLE_MAGIC
}

/// Whether `magic` tags a growable arena.
pub fn is_moveable_magic(magic: u32) -> bool {
    magic & MAGIC_MASK == MOVEABLE_MAGIC
}

/// Build a magic value from its two flags.
pub fn make_magic(moveable: bool, small_blocks: bool) -> u32 {
    let base = if moveable { MOVEABLE_MAGIC } else { FIXED_MAGIC };
    base | if small_blocks { SMALL_BLOCK_FLAG } else { 0 }
}

/// A decoded copy of the header.
///
/// The arena itself reads and writes header fields in place; this struct is
/// for reopening persisted regions and for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArenaHeader {
    /// Raw magic including the small-block flag.
    pub magic: u32,
    /// Root message offset.
    pub message: Offset,
    /// High-water mark.
    pub hwm: u32,
    /// Total capacity in bytes.
    pub full_size: u32,
    /// First free block.
    pub free_list: Offset,
    /// Out-of-band metadata.
    pub metadata: Offset,
    /// Run registry per size class.
    pub bitmaps: [Offset; NUM_SIZE_CLASSES],
}

impl ArenaHeader {
    /// Decode a header from the start of `bytes`.
    ///
    /// Fails if `bytes` is shorter than [`HEADER_SIZE`] or the magic is not
    /// an arena tag.
    pub fn decode(bytes: &[u8]) -> Result<Self, ArenaError> {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(ArenaError::InvalidConfig {
                reason: format!(
                    "region of {} bytes is smaller than the {HEADER_SIZE}-byte header",
                    bytes.len()
                ),
            });
        }
        let field = |at: u32| u32::decode(&bytes[at as usize..at as usize + 4]);
        let magic = field(MAGIC_AT);
        if !is_valid_magic(magic) {
            return Err(ArenaError::InvalidMagic { magic });
        }
        let mut bitmaps = [Offset::NULL; NUM_SIZE_CLASSES];
        for (i, slot) in bitmaps.iter_mut().enumerate() {
            *slot = Offset(field(BITMAPS_AT + 4 * i as u32));
        }
        Ok(Self {
            magic,
            message: Offset(field(MESSAGE_AT)),
            hwm: field(HWM_AT),
            full_size: field(FULL_SIZE_AT),
            free_list: Offset(field(FREE_LIST_AT)),
            metadata: Offset(field(METADATA_AT)),
            bitmaps,
        })
    }

    /// Encode into the first [`HEADER_SIZE`] bytes of `bytes`.
    pub(crate) fn encode(&self, bytes: &mut [u8]) {
        let mut put = |at: u32, v: u32| v.encode(&mut bytes[at as usize..at as usize + 4]);
        put(MAGIC_AT, self.magic);
        put(MESSAGE_AT, self.message.0);
        put(HWM_AT, self.hwm);
        put(FULL_SIZE_AT, self.full_size);
        put(FREE_LIST_AT, self.free_list.0);
        put(METADATA_AT, self.metadata.0);
        for (i, b) in self.bitmaps.iter().enumerate() {
            put(BITMAPS_AT + 4 * i as u32, b.0);
        }
    }

    /// Whether the small-block allocator is enabled.
    pub fn small_blocks_enabled(&self) -> bool {
        self.magic & SMALL_BLOCK_FLAG != 0
    }

    /// Whether the arena was laid out as growable.
    pub fn is_moveable(&self) -> bool {
        is_moveable_magic(self.magic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_forty_bytes() {
        assert_eq!(HEADER_SIZE, 40);
    }

    #[test]
    fn magic_flags() {
        let m = make_magic(true, true);
        assert!(is_valid_magic(m));
        assert!(is_moveable_magic(m));
        assert_eq!(m & SMALL_BLOCK_FLAG, 1);

        let f = make_magic(false, false);
        assert!(is_valid_magic(f));
        assert!(!is_moveable_magic(f));
        assert!(!is_valid_magic(0x1234_5678));
    }

    #[test]
    fn encode_decode_preserves_fields() {
        let header = ArenaHeader {
            magic: make_magic(false, true),
            message: Offset(44),
            hwm: 120,
            full_size: 4096,
            free_list: Offset(120),
            metadata: Offset::NULL,
            bitmaps: [Offset(64), Offset::NULL, Offset::NULL, Offset(200)],
        };
        let mut bytes = [0u8; 64];
        header.encode(&mut bytes);
        assert_eq!(ArenaHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn decode_rejects_bad_magic_and_short_regions() {
        assert!(matches!(
            ArenaHeader::decode(&[0u8; 64]),
            Err(ArenaError::InvalidMagic { magic: 0 })
        ));
        assert!(matches!(
            ArenaHeader::decode(&[0u8; 8]),
            Err(ArenaError::InvalidConfig { .. })
        ));
    }
}
