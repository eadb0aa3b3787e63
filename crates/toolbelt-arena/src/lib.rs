//! Relocatable, offset-addressed arena allocator.
//!
//! An [`Arena`] is a heap laid out inside one contiguous byte region. Every
//! reference stored in it is a 32-bit [`Offset`] from the region base, so
//! the region can be copied, written to disk, mapped into another process
//! or grown by reallocation without fixing anything up. It is the backing
//! store for self-contained serialized messages.
//!
//! # Layout
//!
//! ```text
//! 0        40
//! +--------+-------------------------------------------------------+
//! | header | allocated blocks and free blocks, tiling to capacity  |
//! +--------+-------------------------------------------------------+
//!
//! header:  magic | message | hwm | full_size | free_list | metadata | bitmaps[4]
//! block:   prefix:u32 | payload            (prefix = length or small-block tag)
//! free:    length:u32 | next:Offset | ...  (address-ordered, coalesced)
//! ```
//!
//! # Allocators
//!
//! - **Free list:** first-fit over an address-ordered list, merging
//!   neighbours on free. On exhaustion a growable arena doubles its
//!   capacity through its [`GrowthStrategy`].
//! - **Small blocks:** requests of up to 128 bytes are served from bitmap
//!   runs of 16/32/64/128-byte slots, themselves carved from the free list.
//!
//! Vectors ([`VectorHandle`]) and length-prefixed strings live on top of
//! both. Methods that can allocate take `&mut self`; hold offsets, not
//! slices, across them.
//!
//! The arena is single-threaded and has no internal locking.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unsafe_code)]

pub mod arena;
pub mod bitmap;
pub mod block;
pub mod config;
pub mod error;
pub mod freelist;
pub mod growth;
pub mod header;
pub mod inspect;
pub mod offset;
pub mod string;
pub mod vector;

// Public re-exports for the primary API surface.
pub use arena::Arena;
pub use bitmap::{RunStats, SizeClass};
pub use block::BlockTag;
pub use config::ArenaConfig;
pub use error::ArenaError;
pub use freelist::AllocOptions;
pub use growth::{GrowthStrategy, ReallocGrowth};
pub use header::{ArenaHeader, HEADER_SIZE};
pub use inspect::{ArenaDump, FreeBlock};
pub use offset::{Offset, Scalar};
pub use vector::VectorHandle;
