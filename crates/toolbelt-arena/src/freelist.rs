//! First-fit, address-ordered, coalescing free-list allocator.
//!
//! Free blocks form a singly linked list sorted by offset. Each node is
//! `length` (header included) followed by `next`, overlapping the freed
//! memory. Allocation takes the lower part of the first node that fits and
//! leaves the remainder in the list when it can hold a node header; freeing
//! re-inserts in address order and merges with both neighbours. When the
//! list is exhausted a growable arena doubles through its strategy and
//! retries once.

use tracing::{debug, warn};

use crate::arena::{Arena, Region};
use crate::bitmap::SizeClass;
use crate::block::{align_up, BlockTag, FreeNode, FREE_HEADER_SIZE, MIN_PAYLOAD, PREFIX_SIZE};
use crate::config::ArenaConfig;
use crate::error::ArenaError;
use crate::offset::Offset;

/// Per-call allocation options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocOptions {
    /// Payload sizes are rounded up to this power of two. Default: 8.
    pub alignment: u32,
    /// Zero the returned payload. Default: true.
    pub clear: bool,
    /// Allow routing to the small-block allocator. Default: true.
    pub small_blocks: bool,
}

impl AllocOptions {
    /// Options that never route to the small-block allocator.
    pub fn plain() -> Self {
        Self {
            small_blocks: false,
            ..Self::default()
        }
    }

    /// Same options with a different alignment.
    pub fn aligned(self, alignment: u32) -> Self {
        Self { alignment, ..self }
    }

    /// Same options with zeroing switched on or off.
    pub fn cleared(self, clear: bool) -> Self {
        Self { clear, ..self }
    }
}

impl Default for AllocOptions {
    fn default() -> Self {
        Self {
            alignment: 8,
            clear: true,
            small_blocks: true,
        }
    }
}

impl Arena<'_> {
    // ── Allocation ──────────────────────────────────────────────

    /// Allocate `size` zeroed bytes with default options.
    ///
    /// The arena may relocate; re-resolve any offsets held as addresses.
    pub fn allocate(&mut self, size: u32) -> Result<Offset, ArenaError> {
        self.allocate_with(size, AllocOptions::default())
    }

    /// Allocate `size` bytes.
    pub fn allocate_with(&mut self, size: u32, opts: AllocOptions) -> Result<Offset, ArenaError> {
        if size == 0 {
            return Err(ArenaError::ZeroSize);
        }
        if !opts.alignment.is_power_of_two() {
            return Err(ArenaError::InvalidAlignment {
                alignment: opts.alignment,
            });
        }
        if opts.small_blocks && self.small_blocks_enabled() {
            if let Some(class) = SizeClass::for_size(size) {
                return self.allocate_small(class, size, opts.clear);
            }
        }
        let payload = self.payload_for(size, opts.alignment)?;
        let full = payload
            .checked_add(PREFIX_SIZE)
            .ok_or_else(|| self.out_of_memory(size as u64))?;

        let offset = match self.take_first_fit(payload, full)? {
            Some(offset) => offset,
            None => {
                self.grow_for(full)?;
                self.take_first_fit(payload, full)?
                    .ok_or_else(|| self.out_of_memory(full as u64))?
            }
        };
        if opts.clear {
            let len = self.load_u32(offset.0 - PREFIX_SIZE);
            self.zero(offset.0, len);
        }
        Ok(offset)
    }

    /// Allocate `n` individually freeable blocks of `size` bytes from a
    /// single free-list carve. The last block absorbs any slack.
    pub fn allocate_many(
        &mut self,
        size: u32,
        n: u32,
        opts: AllocOptions,
    ) -> Result<Vec<Offset>, ArenaError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if size == 0 {
            return Err(ArenaError::ZeroSize);
        }
        if !opts.alignment.is_power_of_two() {
            return Err(ArenaError::InvalidAlignment {
                alignment: opts.alignment,
            });
        }
        let payload = self.payload_for(size, opts.alignment)?;
        let stride = payload + PREFIX_SIZE;
        let total = (stride as u64) * (n as u64) - PREFIX_SIZE as u64;
        let total = u32::try_from(total).map_err(|_| self.out_of_memory(total))?;

        let first = self.allocate_with(
            total,
            AllocOptions {
                small_blocks: false,
                ..opts
            },
        )?;
        let (_, tag) = self.block_prefix(first)?;
        let carved = tag.len();
        let mut blocks = Vec::with_capacity(n as usize);
        for i in 0..n {
            let data = first.0 + i * stride;
            let len = if i + 1 == n {
                carved - (n - 1) * stride
            } else {
                payload
            };
            self.store_u32(data - PREFIX_SIZE, BlockTag::Plain { len }.encode());
            blocks.push(Offset(data));
        }
        Ok(blocks)
    }

    /// Allocate the root message and record it in the header.
    pub fn allocate_main_message(&mut self, size: u32) -> Result<Offset, ArenaError> {
        let message = self.allocate_with(size, AllocOptions::default())?;
        self.set_message(message);
        Ok(message)
    }

    /// Copy `metadata` into the arena and record it in the header.
    pub fn allocate_metadata(&mut self, metadata: &[u8]) -> Result<Offset, ArenaError> {
        let len = u32::try_from(metadata.len())
            .map_err(|_| self.out_of_memory(metadata.len() as u64))?;
        let offset = self.allocate_with(len, AllocOptions::plain().aligned(1).cleared(false))?;
        self.bytes_mut(offset, len)
            .ok_or(ArenaError::InvalidOffset { offset })?
            .copy_from_slice(metadata);
        self.set_metadata(offset);
        Ok(offset)
    }

    fn payload_for(&self, size: u32, alignment: u32) -> Result<u32, ArenaError> {
        align_up(size, alignment)
            .map(|p| p.max(MIN_PAYLOAD))
            .ok_or_else(|| self.out_of_memory(size as u64))
    }

    pub(crate) fn out_of_memory(&self, requested: u64) -> ArenaError {
        ArenaError::OutOfMemory {
            requested,
            capacity: self.capacity(),
        }
    }

    /// First-fit scan. Splits the chosen node when the remainder can hold a
    /// node header, otherwise hands out the whole node.
    fn take_first_fit(&mut self, payload: u32, full: u32) -> Result<Option<Offset>, ArenaError> {
        let mut prev = None;
        let mut cur = self.free_list_head().0;
        while cur != 0 {
            let node = self.free_node(cur)?;
            if node.len >= full {
                let rem = node.len - full;
                let payload = if rem >= FREE_HEADER_SIZE {
                    let split = cur + full;
                    self.write_free_node(
                        split,
                        FreeNode {
                            len: rem,
                            next: node.next,
                        },
                    );
                    self.link(prev, split);
                    payload
                } else {
                    self.link(prev, node.next);
                    node.len - PREFIX_SIZE
                };
                self.store_u32(cur, BlockTag::Plain { len: payload }.encode());
                self.bump_hwm(cur + PREFIX_SIZE + payload);
                return Ok(Some(Offset(cur + PREFIX_SIZE)));
            }
            prev = Some(cur);
            cur = node.next;
        }
        Ok(None)
    }

    /// Grow through the strategy until the new memory alone can hold
    /// `full` bytes, then hand it to the free list.
    fn grow_for(&mut self, full: u32) -> Result<(), ArenaError> {
        let old = self.capacity();
        if self.growth.is_none() {
            return Err(self.out_of_memory(full as u64));
        }
        let mut new = old as u64 * 2;
        while new - (old as u64) < full as u64 {
            new *= 2;
        }
        if new > ArenaConfig::MAX_CAPACITY as u64 {
            warn!(old, new, "arena growth refused: beyond maximum capacity");
            return Err(self.out_of_memory(full as u64));
        }
        let new = new as u32;

        let refused = ArenaError::OutOfMemory {
            requested: full as u64,
            capacity: old,
        };
        let Region::Owned(memory) = &mut self.region else {
            return Err(refused);
        };
        let Some(strategy) = self.growth.as_mut() else {
            return Err(refused);
        };
        if let Err(err) = strategy.grow(memory, old as usize, new as usize) {
            warn!(old, new, %err, "arena growth strategy failed");
            return Err(err);
        }
        if memory.len() < new as usize {
            return Err(ArenaError::GrowthFailed {
                requested: new as u64,
                reason: format!("strategy provided only {} bytes", memory.len()),
            });
        }
        self.set_capacity(new);

        // The last free node absorbs the new memory when it ends at the old
        // boundary; otherwise the new memory becomes a node of its own.
        let mut last = None;
        let mut cur = self.free_list_head().0;
        while cur != 0 {
            let node = self.free_node(cur)?;
            last = Some((cur, node));
            cur = node.next;
        }
        let added = new - old;
        match last {
            Some((at, node)) if at + node.len == old => {
                self.write_free_node(
                    at,
                    FreeNode {
                        len: node.len + added,
                        next: 0,
                    },
                );
            }
            _ => {
                self.write_free_node(old, FreeNode { len: added, next: 0 });
                self.link(last.map(|(at, _)| at), old);
            }
        }
        debug!(old, new, "arena grew");
        Ok(())
    }

    // ── Free ────────────────────────────────────────────────────

    /// Return a block to the arena. Freeing [`Offset::NULL`] is a no-op.
    ///
    /// Never relocates the arena.
    pub fn free(&mut self, offset: Offset) -> Result<(), ArenaError> {
        if offset.is_null() {
            return Ok(());
        }
        match self.block_prefix(offset)? {
            (at, BlockTag::Plain { len }) => self.release(at, len + PREFIX_SIZE, offset),
            (_, BlockTag::Small { class, run, bit, .. }) => {
                self.free_small(offset, class, run, bit)
            }
        }
    }

    /// Insert `span` bytes at `start` into the free list, merging with the
    /// nodes immediately above and below when they touch.
    pub(crate) fn release(&mut self, start: u32, span: u32, owner: Offset) -> Result<(), ArenaError> {
        let mut prev: Option<(u32, FreeNode)> = None;
        let mut cur = self.free_list_head().0;
        while cur != 0 && cur < start {
            let node = self.free_node(cur)?;
            prev = Some((cur, node));
            cur = node.next;
        }
        if cur == start {
            return Err(ArenaError::DoubleFree { offset: owner });
        }
        if let Some((p, node)) = prev {
            if p + node.len > start {
                return Err(ArenaError::DoubleFree { offset: owner });
            }
        }
        let end = start + span;
        if cur != 0 && end > cur {
            return Err(ArenaError::corrupted(
                start,
                format!("freed block overlaps free block at {cur:#x}"),
            ));
        }

        let mut merged = FreeNode {
            len: span,
            next: cur,
        };
        if cur != 0 && end == cur {
            let above = self.free_node(cur)?;
            merged.len += above.len;
            merged.next = above.next;
        }
        match prev {
            Some((p, node)) if p + node.len == start => {
                self.write_free_node(
                    p,
                    FreeNode {
                        len: node.len + merged.len,
                        next: merged.next,
                    },
                );
            }
            _ => {
                self.write_free_node(start, merged);
                self.link(prev.map(|(p, _)| p), start);
            }
        }
        Ok(())
    }

    // ── Realloc ─────────────────────────────────────────────────

    /// Resize the block at `offset` to `size` bytes with default options.
    pub fn realloc(&mut self, offset: Offset, size: u32) -> Result<Offset, ArenaError> {
        self.realloc_with(offset, size, AllocOptions::default())
    }

    /// Resize the block at `offset`, returning its (possibly new) offset.
    ///
    /// A null `offset` allocates. Contents up to the smaller of the two
    /// sizes are preserved; with `clear`, bytes past the old size are zero.
    pub fn realloc_with(
        &mut self,
        offset: Offset,
        size: u32,
        opts: AllocOptions,
    ) -> Result<Offset, ArenaError> {
        if offset.is_null() {
            return self.allocate_with(size, opts);
        }
        if size == 0 {
            return Err(ArenaError::ZeroSize);
        }
        if !opts.alignment.is_power_of_two() {
            return Err(ArenaError::InvalidAlignment {
                alignment: opts.alignment,
            });
        }
        match self.block_prefix(offset)? {
            (at, BlockTag::Small {
                class,
                run,
                bit,
                size: old,
            }) => {
                let routed = opts.small_blocks && self.small_blocks_enabled();
                if routed && SizeClass::for_size(size) == Some(class) {
                    let tag = BlockTag::Small {
                        class,
                        run,
                        bit,
                        size: size as u8,
                    };
                    self.store_u32(at, tag.encode());
                    if opts.clear && size > old as u32 {
                        self.zero(offset.0 + old as u32, size - old as u32);
                    }
                    return Ok(offset);
                }
                self.move_block(offset, old as u32, size, opts)
            }
            (at, BlockTag::Plain { len: old }) => self.realloc_plain(offset, at, old, size, opts),
        }
    }

    fn realloc_plain(
        &mut self,
        offset: Offset,
        at: u32,
        old: u32,
        size: u32,
        opts: AllocOptions,
    ) -> Result<Offset, ArenaError> {
        let new_len = self.payload_for(size, opts.alignment)?;
        if new_len == old {
            return Ok(offset);
        }
        if new_len < old {
            let rem = old - new_len;
            if rem >= FREE_HEADER_SIZE {
                self.store_u32(at, BlockTag::Plain { len: new_len }.encode());
                self.release(offset.0 + new_len, rem, offset)?;
            }
            return Ok(offset);
        }

        let diff = new_len - old;
        let end = offset.0 + old;

        // Neighbours in the free list: `below` is the last node under the
        // block (with the node before it), `above` the first node over it.
        let mut below_prev = None;
        let mut below: Option<(u32, FreeNode)> = None;
        let mut cur = self.free_list_head().0;
        while cur != 0 && cur < at {
            let node = self.free_node(cur)?;
            below_prev = below.map(|(b, _)| b);
            below = Some((cur, node));
            cur = node.next;
        }
        let above = if cur != 0 {
            Some((cur, self.free_node(cur)?))
        } else {
            None
        };
        let above_adjacent = above.filter(|&(a, _)| a == end);

        // Expand into the free block above, leaving room for its header.
        if let Some((a, node)) = above_adjacent {
            if node.len >= diff + FREE_HEADER_SIZE {
                let moved = a + diff;
                self.write_free_node(
                    moved,
                    FreeNode {
                        len: node.len - diff,
                        next: node.next,
                    },
                );
                self.link(below.map(|(b, _)| b), moved);
                self.store_u32(at, BlockTag::Plain { len: new_len }.encode());
                if opts.clear {
                    self.zero(end, diff);
                }
                self.bump_hwm(offset.0 + new_len);
                return Ok(offset);
            }
        }

        // Slide down into the free block below.
        if let Some((b, node)) = below {
            if b + node.len == at && node.len >= diff {
                let mut total = node.len + PREFIX_SIZE + old;
                let mut next = cur;
                if let Some((_, above_node)) = above_adjacent {
                    total += above_node.len;
                    next = above_node.next;
                }
                let data = b + PREFIX_SIZE;
                self.copy_within(offset.0, old, data);
                let mut payload = new_len;
                let rem = total - PREFIX_SIZE - new_len;
                if rem >= FREE_HEADER_SIZE {
                    let tail = data + new_len;
                    self.write_free_node(tail, FreeNode { len: rem, next });
                    self.link(below_prev, tail);
                } else {
                    payload += rem;
                    self.link(below_prev, next);
                }
                self.store_u32(b, BlockTag::Plain { len: payload }.encode());
                if opts.clear {
                    self.zero(data + old, payload - old);
                }
                self.bump_hwm(data + payload);
                return Ok(Offset(data));
            }
        }

        self.move_block(offset, old, size, opts)
    }

    /// Allocate a new block, copy the old contents over and free the old
    /// block.
    fn move_block(
        &mut self,
        offset: Offset,
        old: u32,
        size: u32,
        opts: AllocOptions,
    ) -> Result<Offset, ArenaError> {
        let new = self.allocate_with(size, opts.cleared(false))?;
        let new_len = self.block_tag(new)?.len();
        let keep = old.min(new_len);
        self.copy_within(offset.0, keep, new.0);
        if opts.clear && new_len > keep {
            self.zero(new.0 + keep, new_len - keep);
        }
        self.free(offset)?;
        Ok(new)
    }
}
