//! The arena value: one contiguous region plus an optional growth strategy.
//!
//! [`Arena`] owns (or borrows) the bytes and is the only way to reach them.
//! Every method that can allocate takes `&mut self`, so the borrow checker
//! rules out holding a slice into the region across a call that may
//! relocate it. Callers keep [`Offset`]s and re-resolve them afterwards.
//!
//! # Region kinds
//!
//! ```text
//! Arena::fixed(&mut [u8])      caller-owned, never grows
//! Arena::with_capacity(n)      owned Vec<u8>, never grows
//! Arena::growable(n, strategy) owned Vec<u8>, grows through the strategy
//! Arena::open(&mut [u8])       reopen a region laid out earlier
//! ```

use std::fmt;

use tracing::trace;

use crate::bitmap::{SizeClass, NUM_SIZE_CLASSES};
use crate::block::{BlockTag, FreeNode, FREE_HEADER_SIZE, PREFIX_SIZE};
use crate::config::{validate_capacity, ArenaConfig};
use crate::error::ArenaError;
use crate::growth::{GrowthStrategy, ReallocGrowth};
use crate::header::{
    is_moveable_magic, is_valid_magic, make_magic, ArenaHeader, BITMAPS_AT, FREE_LIST_AT,
    FULL_SIZE_AT, HEADER_SIZE, HWM_AT, MAGIC_AT, MESSAGE_AT, METADATA_AT, SMALL_BLOCK_FLAG,
};
use crate::offset::{Offset, Scalar};

pub(crate) enum Region<'a> {
    Borrowed(&'a mut [u8]),
    Owned(Vec<u8>),
}

impl Region<'_> {
    fn bytes(&self) -> &[u8] {
        match self {
            Region::Borrowed(b) => b,
            Region::Owned(v) => v,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Region::Borrowed(b) => b,
            Region::Owned(v) => v,
        }
    }
}

/// A heap laid out inside a single contiguous, relocatable byte region.
///
/// The arena is not `Sync`-safe for mutation and provides no internal
/// locking; share it across threads only behind an external lock.
pub struct Arena<'a> {
    pub(crate) region: Region<'a>,
    pub(crate) growth: Option<Box<dyn GrowthStrategy + 'a>>,
}

impl<'a> Arena<'a> {
    // ── Construction ────────────────────────────────────────────

    /// Lay out a fixed-capacity arena over caller-owned memory, with the
    /// small-block allocator enabled.
    pub fn fixed(memory: &'a mut [u8]) -> Result<Self, ArenaError> {
        Self::fixed_with(memory, true)
    }

    /// Lay out a fixed-capacity arena over caller-owned memory.
    pub fn fixed_with(memory: &'a mut [u8], small_blocks: bool) -> Result<Self, ArenaError> {
        validate_capacity(memory.len() as u64)?;
        let capacity = memory.len() as u32;
        let mut arena = Self {
            region: Region::Borrowed(memory),
            growth: None,
        };
        arena.init(capacity, false, small_blocks);
        Ok(arena)
    }

    /// An owned, fixed-capacity arena with small blocks enabled.
    pub fn with_capacity(capacity: u32) -> Result<Self, ArenaError> {
        Self::from_config(ArenaConfig::new(capacity))
    }

    /// An owned arena that grows through `strategy` when exhausted.
    pub fn growable(
        capacity: u32,
        strategy: impl GrowthStrategy + 'a,
    ) -> Result<Self, ArenaError> {
        validate_capacity(capacity as u64)?;
        let mut arena = Self {
            region: Region::Owned(vec![0u8; capacity as usize]),
            growth: Some(Box::new(strategy)),
        };
        arena.init(capacity, true, true);
        Ok(arena)
    }

    /// Build an owned arena from a validated [`ArenaConfig`].
    pub fn from_config(config: ArenaConfig) -> Result<Self, ArenaError> {
        config.validate()?;
        let growth: Option<Box<dyn GrowthStrategy + 'a>> = if config.growable {
            Some(Box::new(ReallocGrowth::with_ceiling(config.max_capacity)))
        } else {
            None
        };
        let mut arena = Self {
            region: Region::Owned(vec![0u8; config.capacity as usize]),
            growth,
        };
        arena.init(config.capacity, config.growable, config.small_blocks);
        Ok(arena)
    }

    /// Reopen caller-owned memory that already holds an arena.
    ///
    /// The header is validated but the region is not walked; call
    /// [`Arena::validate`] for a full consistency check. A reopened
    /// borrowed region never grows.
    pub fn open(memory: &'a mut [u8]) -> Result<Self, ArenaError> {
        Self::check_reopen(memory)?;
        Ok(Self {
            region: Region::Borrowed(memory),
            growth: None,
        })
    }

    /// Reopen an owned buffer that already holds an arena.
    ///
    /// Attach a strategy with [`Arena::set_growth_strategy`] to make it
    /// growable again.
    pub fn open_owned(memory: Vec<u8>) -> Result<Self, ArenaError> {
        Self::check_reopen(&memory)?;
        Ok(Self {
            region: Region::Owned(memory),
            growth: None,
        })
    }

    fn check_reopen(memory: &[u8]) -> Result<(), ArenaError> {
        let header = ArenaHeader::decode(memory)?;
        if header.full_size as usize > memory.len() {
            return Err(ArenaError::InvalidConfig {
                reason: format!(
                    "header capacity {} exceeds the {}-byte region",
                    header.full_size,
                    memory.len()
                ),
            });
        }
        validate_capacity(header.full_size as u64)?;
        if header.hwm > header.full_size {
            return Err(ArenaError::corrupted(
                HWM_AT,
                format!("hwm {} beyond capacity {}", header.hwm, header.full_size),
            ));
        }
        Ok(())
    }

    fn init(&mut self, capacity: u32, moveable: bool, small_blocks: bool) {
        let header = ArenaHeader {
            magic: make_magic(moveable, small_blocks),
            message: Offset::NULL,
            hwm: HEADER_SIZE,
            full_size: capacity,
            free_list: Offset(HEADER_SIZE),
            metadata: Offset::NULL,
            bitmaps: [Offset::NULL; NUM_SIZE_CLASSES],
        };
        header.encode(self.region.bytes_mut());
        self.write_free_node(
            HEADER_SIZE,
            FreeNode {
                len: capacity - HEADER_SIZE,
                next: 0,
            },
        );
        trace!(capacity, moveable, small_blocks, "arena laid out");
    }

    /// Register the strategy used when the free list is exhausted.
    ///
    /// Only owned regions can grow. The header is retagged as moveable.
    pub fn set_growth_strategy(
        &mut self,
        strategy: impl GrowthStrategy + 'a,
    ) -> Result<(), ArenaError> {
        if matches!(self.region, Region::Borrowed(_)) {
            return Err(ArenaError::InvalidConfig {
                reason: "caller-owned memory cannot grow".to_string(),
            });
        }
        self.growth = Some(Box::new(strategy));
        let small = self.small_blocks_enabled();
        self.store_u32(MAGIC_AT, make_magic(true, small));
        Ok(())
    }

    /// Detach the growth strategy, making the arena fixed at its current
    /// capacity.
    pub fn take_growth_strategy(&mut self) -> Option<Box<dyn GrowthStrategy + 'a>> {
        let small = self.small_blocks_enabled();
        self.store_u32(MAGIC_AT, make_magic(false, small));
        self.growth.take()
    }

    // ── Header accessors ────────────────────────────────────────

    /// Raw magic including the small-block flag.
    pub fn magic(&self) -> u32 {
        self.load_u32(MAGIC_AT)
    }

    /// Whether the magic is an arena tag.
    pub fn is_valid_magic(&self) -> bool {
        is_valid_magic(self.magic())
    }

    /// Whether the arena is tagged as relocatable.
    pub fn is_moveable(&self) -> bool {
        is_moveable_magic(self.magic())
    }

    /// Whether small requests are routed to the bitmap allocator.
    pub fn small_blocks_enabled(&self) -> bool {
        self.magic() & SMALL_BLOCK_FLAG != 0
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> u32 {
        self.load_u32(FULL_SIZE_AT)
    }

    /// Bytes in use up to the high-water mark. A snapshot of the first
    /// `size()` bytes is a complete copy of every allocation.
    pub fn size(&self) -> u32 {
        self.load_u32(HWM_AT)
    }

    /// Offset of the root message.
    pub fn message(&self) -> Offset {
        Offset(self.load_u32(MESSAGE_AT))
    }

    /// Offset of the out-of-band metadata.
    pub fn metadata(&self) -> Offset {
        Offset(self.load_u32(METADATA_AT))
    }

    /// Offset of the first free block.
    pub fn free_list_head(&self) -> Offset {
        Offset(self.load_u32(FREE_LIST_AT))
    }

    /// Decoded copy of the header.
    pub fn header(&self) -> Result<ArenaHeader, ArenaError> {
        ArenaHeader::decode(self.region.bytes())
    }

    /// The whole arena, `capacity()` bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.region.bytes()[..self.capacity() as usize]
    }

    /// Consume the arena, returning its bytes. Borrowed regions are copied.
    pub fn into_bytes(self) -> Vec<u8> {
        let capacity = self.capacity() as usize;
        match self.region {
            Region::Owned(mut v) => {
                v.truncate(capacity);
                v
            }
            Region::Borrowed(b) => b[..capacity].to_vec(),
        }
    }

    // ── Offset addressing ───────────────────────────────────────

    /// Validate that `len` bytes at `offset` lie inside the arena and
    /// return the byte index. Offset 0, a bad magic and out-of-range
    /// offsets all resolve to `None`.
    pub(crate) fn resolve(&self, offset: Offset, len: u32) -> Option<usize> {
        if offset.is_null() || !self.is_valid_magic() {
            return None;
        }
        let end = (offset.0 as u64) + (len.max(1) as u64);
        if end > self.capacity() as u64 {
            return None;
        }
        Some(offset.0 as usize)
    }

    /// Translate an offset to an absolute address in the current region.
    ///
    /// The address is only meaningful until the next call that can
    /// allocate; store the offset, not the address.
    pub fn to_address(&self, offset: Offset) -> Option<*const u8> {
        let at = self.resolve(offset, 0)?;
        Some(self.region.bytes().as_ptr().wrapping_add(at))
    }

    /// Translate an absolute address inside the region back to an offset.
    ///
    /// Returns [`Offset::NULL`] for a null address, the base address
    /// itself, a bad magic, or an address outside the arena.
    pub fn to_offset(&self, address: *const u8) -> Offset {
        if address.is_null() || !self.is_valid_magic() {
            return Offset::NULL;
        }
        let base = self.region.bytes().as_ptr() as usize;
        let addr = address as usize;
        if addr <= base || addr >= base + self.capacity() as usize {
            return Offset::NULL;
        }
        Offset((addr - base) as u32)
    }

    /// `len` bytes at `offset`.
    pub fn bytes(&self, offset: Offset, len: u32) -> Option<&[u8]> {
        let at = self.resolve(offset, len)?;
        Some(&self.region.bytes()[at..at + len as usize])
    }

    /// `len` mutable bytes at `offset`.
    pub fn bytes_mut(&mut self, offset: Offset, len: u32) -> Option<&mut [u8]> {
        let at = self.resolve(offset, len)?;
        Some(&mut self.region.bytes_mut()[at..at + len as usize])
    }

    /// Read a scalar stored at `offset`.
    pub fn read<T: Scalar>(&self, offset: Offset) -> Option<T> {
        self.bytes(offset, T::WIDTH as u32).map(T::decode)
    }

    /// Store a scalar at `offset`.
    pub fn write<T: Scalar>(&mut self, offset: Offset, value: T) -> Result<(), ArenaError> {
        let bytes = self
            .bytes_mut(offset, T::WIDTH as u32)
            .ok_or(ArenaError::InvalidOffset { offset })?;
        value.encode(bytes);
        Ok(())
    }

    /// Whether the offset slot stored at `offset` is null. An unresolvable
    /// `offset` counts as null.
    pub fn is_null(&self, offset: Offset) -> bool {
        self.read::<Offset>(offset).is_none_or(Offset::is_null)
    }

    // ── Blocks ──────────────────────────────────────────────────

    /// Decode the prefix of the block whose payload starts at `offset`.
    pub fn block_tag(&self, offset: Offset) -> Result<BlockTag, ArenaError> {
        self.block_prefix(offset).map(|(_, tag)| tag)
    }

    /// The payload of the allocated block at `offset`, sized by its prefix.
    pub fn block(&self, offset: Offset) -> Option<&[u8]> {
        let (_, tag) = self.block_prefix(offset).ok()?;
        self.bytes(offset, tag.len())
    }

    /// Mutable payload of the allocated block at `offset`.
    pub fn block_mut(&mut self, offset: Offset) -> Option<&mut [u8]> {
        let (_, tag) = self.block_prefix(offset).ok()?;
        self.bytes_mut(offset, tag.len())
    }

    /// Locate and decode a block prefix, returning its byte position.
    pub(crate) fn block_prefix(&self, offset: Offset) -> Result<(u32, BlockTag), ArenaError> {
        if offset.0 < HEADER_SIZE + PREFIX_SIZE || self.resolve(offset, 0).is_none() {
            return Err(ArenaError::InvalidOffset { offset });
        }
        let at = offset.0 - PREFIX_SIZE;
        let raw = self.load_u32(at);
        let tag = BlockTag::decode(raw)
            .ok_or_else(|| ArenaError::corrupted(at, format!("bad block prefix {raw:#010x}")))?;
        if offset.0 as u64 + tag.len() as u64 > self.capacity() as u64 {
            return Err(ArenaError::corrupted(
                at,
                format!("block of {} bytes runs past the arena", tag.len()),
            ));
        }
        Ok((at, tag))
    }

    // ── Presence bits ───────────────────────────────────────────

    /// Set bit `bit` of the `u32`-word bitfield at `offset`.
    pub fn set_presence_bit(&mut self, bit: u32, offset: Offset) -> Result<(), ArenaError> {
        let word = Self::presence_word(bit, offset)?;
        let v: u32 = self.read(word).ok_or(ArenaError::InvalidOffset { offset: word })?;
        self.write(word, v | (1 << (bit % 32)))
    }

    /// Clear bit `bit` of the bitfield at `offset`.
    pub fn clear_presence_bit(&mut self, bit: u32, offset: Offset) -> Result<(), ArenaError> {
        let word = Self::presence_word(bit, offset)?;
        let v: u32 = self.read(word).ok_or(ArenaError::InvalidOffset { offset: word })?;
        self.write(word, v & !(1 << (bit % 32)))
    }

    /// Whether bit `bit` of the bitfield at `offset` is set.
    pub fn is_present(&self, bit: u32, offset: Offset) -> bool {
        let Ok(word) = Self::presence_word(bit, offset) else {
            return false;
        };
        self.read::<u32>(word)
            .is_some_and(|v| v & (1 << (bit % 32)) != 0)
    }

    fn presence_word(bit: u32, offset: Offset) -> Result<Offset, ArenaError> {
        offset
            .checked_add((bit / 32) * 4)
            .ok_or(ArenaError::InvalidOffset { offset })
    }

    // ── Raw access (crate-internal) ─────────────────────────────
    //
    // Positions passed here come from the allocator's own bookkeeping and
    // are within the region; an out-of-range index is corruption and panics.

    pub(crate) fn region_len(&self) -> usize {
        self.region.bytes().len()
    }

    pub(crate) fn load_u32(&self, at: u32) -> u32 {
        let at = at as usize;
        u32::decode(&self.region.bytes()[at..at + 4])
    }

    pub(crate) fn store_u32(&mut self, at: u32, v: u32) {
        let at = at as usize;
        v.encode(&mut self.region.bytes_mut()[at..at + 4]);
    }

    pub(crate) fn load_u8(&self, at: u32) -> u8 {
        self.region.bytes()[at as usize]
    }

    pub(crate) fn store_u8(&mut self, at: u32, v: u8) {
        self.region.bytes_mut()[at as usize] = v;
    }

    pub(crate) fn zero(&mut self, at: u32, len: u32) {
        let at = at as usize;
        self.region.bytes_mut()[at..at + len as usize].fill(0);
    }

    pub(crate) fn copy_within(&mut self, from: u32, len: u32, to: u32) {
        let from = from as usize;
        self.region
            .bytes_mut()
            .copy_within(from..from + len as usize, to as usize);
    }

    pub(crate) fn set_capacity(&mut self, capacity: u32) {
        self.store_u32(FULL_SIZE_AT, capacity);
    }

    pub(crate) fn set_message(&mut self, offset: Offset) {
        self.store_u32(MESSAGE_AT, offset.0);
    }

    pub(crate) fn set_metadata(&mut self, offset: Offset) {
        self.store_u32(METADATA_AT, offset.0);
    }

    pub(crate) fn set_free_list_head(&mut self, at: u32) {
        self.store_u32(FREE_LIST_AT, at);
    }

    /// Raise the high-water mark to `end` if it is higher.
    pub(crate) fn bump_hwm(&mut self, end: u32) {
        if end > self.size() {
            self.store_u32(HWM_AT, end);
        }
    }

    pub(crate) fn registry_slot(&self, class: SizeClass) -> Offset {
        Offset(self.load_u32(BITMAPS_AT + 4 * class.index() as u32))
    }

    pub(crate) fn set_registry_slot(&mut self, class: SizeClass, registry: Offset) {
        self.store_u32(BITMAPS_AT + 4 * class.index() as u32, registry.0);
    }

    pub(crate) fn free_node(&self, at: u32) -> Result<FreeNode, ArenaError> {
        if at < HEADER_SIZE || at as u64 + 8 > self.capacity() as u64 {
            return Err(ArenaError::corrupted(at, "free block outside the arena"));
        }
        let node = FreeNode {
            len: self.load_u32(at),
            next: self.load_u32(at + 4),
        };
        if node.len < FREE_HEADER_SIZE {
            return Err(ArenaError::corrupted(
                at,
                format!("free block of {} bytes is shorter than its header", node.len),
            ));
        }
        if at as u64 + node.len as u64 > self.capacity() as u64 {
            return Err(ArenaError::corrupted(
                at,
                format!("free block of {} bytes runs past the arena", node.len),
            ));
        }
        if node.next != 0 && node.next <= at {
            return Err(ArenaError::corrupted(at, "free list out of address order"));
        }
        Ok(node)
    }

    pub(crate) fn write_free_node(&mut self, at: u32, node: FreeNode) {
        self.store_u32(at, node.len);
        self.store_u32(at + 4, node.next);
    }

    /// Point `prev`'s next link (or the list head) at `target`.
    pub(crate) fn link(&mut self, prev: Option<u32>, target: u32) {
        match prev {
            Some(p) => self.store_u32(p + 4, target),
            None => self.set_free_list_head(target),
        }
    }
}

impl fmt::Debug for Arena<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity())
            .field("size", &self.size())
            .field("moveable", &self.is_moveable())
            .field("small_blocks", &self.small_blocks_enabled())
            .field("growable", &self.growth.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_arena_over_caller_memory() {
        let mut memory = vec![0u8; 4096];
        let arena = Arena::fixed(&mut memory).unwrap();
        assert_eq!(arena.capacity(), 4096);
        assert_eq!(arena.size(), HEADER_SIZE);
        assert!(!arena.is_moveable());
        assert!(arena.small_blocks_enabled());
        assert_eq!(arena.free_list_head(), Offset(HEADER_SIZE));
    }

    #[test]
    fn fixed_arena_rejects_tiny_region() {
        let mut memory = vec![0u8; 16];
        assert!(matches!(
            Arena::fixed(&mut memory),
            Err(ArenaError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn growable_arena_is_moveable() {
        let arena = Arena::growable(256, ReallocGrowth::new()).unwrap();
        assert!(arena.is_moveable());
        assert_eq!(arena.capacity(), 256);
    }

    #[test]
    fn to_address_rejects_null_and_out_of_range() {
        let arena = Arena::with_capacity(1024).unwrap();
        assert!(arena.to_address(Offset::NULL).is_none());
        assert!(arena.to_address(Offset(1024)).is_none());
        assert!(arena.to_address(Offset(1023)).is_some());
    }

    #[test]
    fn to_offset_round_trips_addresses() {
        let arena = Arena::with_capacity(1024).unwrap();
        let addr = arena.to_address(Offset(100)).unwrap();
        assert_eq!(arena.to_offset(addr), Offset(100));
        assert_eq!(arena.to_offset(arena.as_bytes().as_ptr()), Offset::NULL);
        assert_eq!(arena.to_offset(std::ptr::null()), Offset::NULL);
        let past_end = arena.as_bytes().as_ptr().wrapping_add(1024);
        assert_eq!(arena.to_offset(past_end), Offset::NULL);
    }

    #[test]
    fn bad_magic_disables_addressing() {
        let mut arena = Arena::with_capacity(1024).unwrap();
        arena.store_u32(MAGIC_AT, 0x1234_5678);
        assert!(arena.to_address(Offset(100)).is_none());
        assert_eq!(arena.read::<u32>(Offset(100)), None);
    }

    #[test]
    fn read_write_scalars() {
        let mut arena = Arena::with_capacity(1024).unwrap();
        arena.write(Offset(200), 0xdead_beefu32).unwrap();
        arena.write(Offset(204), -1.5f32).unwrap();
        assert_eq!(arena.read::<u32>(Offset(200)), Some(0xdead_beef));
        assert_eq!(arena.read::<f32>(Offset(204)), Some(-1.5));
        assert!(matches!(
            arena.write(Offset(1022), 1u32),
            Err(ArenaError::InvalidOffset { .. })
        ));
    }

    #[test]
    fn presence_bits_span_words() {
        let mut arena = Arena::with_capacity(1024).unwrap();
        let field = Offset(300);
        arena.write(field, 0u32).unwrap();
        arena.write(Offset(304), 0u32).unwrap();
        arena.set_presence_bit(3, field).unwrap();
        arena.set_presence_bit(35, field).unwrap();
        assert!(arena.is_present(3, field));
        assert!(arena.is_present(35, field));
        assert!(!arena.is_present(4, field));
        assert_eq!(arena.read::<u32>(Offset(304)), Some(1 << 3));
        arena.clear_presence_bit(3, field).unwrap();
        assert!(!arena.is_present(3, field));
    }

    #[test]
    fn reopen_owned_bytes() {
        let arena = Arena::with_capacity(2048).unwrap();
        let bytes = arena.into_bytes();
        let reopened = Arena::open_owned(bytes).unwrap();
        assert_eq!(reopened.capacity(), 2048);
        assert!(reopened.growth.is_none());
    }

    #[test]
    fn oversized_free_node_is_corruption() {
        let mut arena = Arena::with_capacity(256).unwrap();
        arena.store_u32(HEADER_SIZE, 100_000);
        let mut reopened = Arena::open_owned(arena.into_bytes()).unwrap();
        assert!(matches!(
            reopened.allocate(1000),
            Err(ArenaError::Corrupted { .. })
        ));
        assert!(matches!(
            reopened.check_free_list(),
            Err(ArenaError::Corrupted { .. })
        ));
        assert_eq!(reopened.free_blocks().count(), 0);
    }

    #[test]
    fn reopen_rejects_garbage() {
        let mut memory = vec![0u8; 256];
        assert!(matches!(
            Arena::open(&mut memory),
            Err(ArenaError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn borrowed_region_refuses_growth_strategy() {
        let mut memory = vec![0u8; 512];
        let mut arena = Arena::fixed(&mut memory).unwrap();
        assert!(arena.set_growth_strategy(ReallocGrowth::new()).is_err());
        assert!(!arena.is_moveable());
    }

    #[test]
    fn attaching_and_detaching_strategy_retags_magic() {
        let mut arena = Arena::with_capacity(512).unwrap();
        arena.set_growth_strategy(ReallocGrowth::new()).unwrap();
        assert!(arena.is_moveable());
        assert!(arena.small_blocks_enabled());
        assert!(arena.take_growth_strategy().is_some());
        assert!(!arena.is_moveable());
    }
}
