//! Block prefixes and free-list nodes.
//!
//! Every allocated block is preceded by a 4-byte prefix. Free-list blocks
//! store their payload length there; small blocks store a packed record that
//! lets `free` find the owning run without searching:
//!
//! ```text
//! bit  31     1 = small block
//! bits 30-26  bit number within the run
//! bits 25-8   index into the size class's run registry
//! bits 7-0    requested size
//! ```
//!
//! The packing is confined to [`BlockTag::encode`] and [`BlockTag::decode`].

use crate::bitmap::SizeClass;

/// Width of the prefix preceding every allocated block.
pub const PREFIX_SIZE: u32 = 4;

/// Width of a free-list node header (`length` + `next`).
pub const FREE_HEADER_SIZE: u32 = 8;

/// Smallest payload handed out by the free list, so that any freed block can
/// hold a free-list node.
pub(crate) const MIN_PAYLOAD: u32 = FREE_HEADER_SIZE - PREFIX_SIZE;

const SMALL_FLAG: u32 = 1 << 31;
const BIT_SHIFT: u32 = 26;
const BIT_MASK: u32 = 0x1f;
const RUN_SHIFT: u32 = 8;
const SIZE_MASK: u32 = 0xff;

/// Largest run index representable in a small-block prefix.
pub const MAX_RUN_INDEX: u32 = 0x3ffff;

/// Decoded form of an allocated block's prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockTag {
    /// Carved from the free list.
    Plain {
        /// Payload length in bytes (excludes the prefix).
        len: u32,
    },
    /// A slot in a small-block run.
    Small {
        /// Size class serving the slot.
        class: SizeClass,
        /// Index of the run in the class's registry.
        run: u32,
        /// Bit number of the slot in the run's bitmap.
        bit: u8,
        /// Size requested by the caller (at most the class's slot size).
        size: u8,
    },
}

impl BlockTag {
    /// Decode a raw prefix. Returns `None` for a small-block record whose
    /// size field maps to no size class.
    pub fn decode(raw: u32) -> Option<Self> {
        if raw & SMALL_FLAG == 0 {
            return Some(BlockTag::Plain { len: raw });
        }
        let size = raw & SIZE_MASK;
        let class = SizeClass::for_size(size)?;
        Some(BlockTag::Small {
            class,
            run: (raw >> RUN_SHIFT) & MAX_RUN_INDEX,
            bit: ((raw >> BIT_SHIFT) & BIT_MASK) as u8,
            size: size as u8,
        })
    }

    /// Pack into the 4-byte prefix form.
    pub fn encode(self) -> u32 {
        match self {
            BlockTag::Plain { len } => {
                debug_assert!(len & SMALL_FLAG == 0, "plain block length overflows tag");
                len
            }
            BlockTag::Small { run, bit, size, .. } => {
                SMALL_FLAG
                    | ((bit as u32 & BIT_MASK) << BIT_SHIFT)
                    | ((run & MAX_RUN_INDEX) << RUN_SHIFT)
                    | (size as u32 & SIZE_MASK)
            }
        }
    }

    /// Usable length of the block as seen by its owner.
    pub fn len(self) -> u32 {
        match self {
            BlockTag::Plain { len } => len,
            BlockTag::Small { size, .. } => size as u32,
        }
    }

    /// Whether the block holds no bytes.
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Whether this is a small-block slot.
    pub fn is_small(self) -> bool {
        matches!(self, BlockTag::Small { .. })
    }
}

/// A node of the address-ordered free list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FreeNode {
    /// Length including this header.
    pub(crate) len: u32,
    /// Offset of the next node, 0 at the end of the list.
    pub(crate) next: u32,
}

/// Round `n` up to a multiple of `alignment` (a power of two).
pub(crate) fn align_up(n: u32, alignment: u32) -> Option<u32> {
    debug_assert!(alignment.is_power_of_two());
    Some(n.checked_add(alignment - 1)? & !(alignment - 1))
}
