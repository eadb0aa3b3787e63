//! Consistency checks and human-readable dumps.

use std::fmt::{self, Write as _};

use smallvec::SmallVec;

use crate::arena::Arena;
use crate::bitmap::SizeClass;
use crate::block::{BlockTag, PREFIX_SIZE};
use crate::error::ArenaError;
use crate::header::HEADER_SIZE;
use crate::offset::Offset;

/// One node of the free list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeBlock {
    /// Offset of the node header.
    pub offset: Offset,
    /// Length in bytes, node header included.
    pub len: u32,
}

impl FreeBlock {
    /// One past the last byte of the block.
    pub fn end(&self) -> u32 {
        self.offset.0 + self.len
    }
}

/// Iterator over the free list in address order.
///
/// Stops early at the first malformed node; [`Arena::check_free_list`]
/// reports what was wrong.
pub struct FreeBlocks<'b, 'a> {
    arena: &'b Arena<'a>,
    next: u32,
}

impl Iterator for FreeBlocks<'_, '_> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<FreeBlock> {
        if self.next == 0 {
            return None;
        }
        let at = self.next;
        match self.arena.free_node(at) {
            Ok(node) => {
                self.next = node.next;
                Some(FreeBlock {
                    offset: Offset(at),
                    len: node.len,
                })
            }
            Err(_) => {
                self.next = 0;
                None
            }
        }
    }
}

impl<'a> Arena<'a> {
    /// Walk the free list.
    pub fn free_blocks(&self) -> FreeBlocks<'_, 'a> {
        FreeBlocks {
            arena: self,
            next: self.free_list_head().0,
        }
    }

    /// Total bytes on the free list.
    pub fn free_bytes(&self) -> u64 {
        self.free_blocks().map(|b| b.len as u64).sum()
    }

    /// Walk the free list checking that every node is in bounds, at least a
    /// node header long and in strictly ascending order.
    pub fn check_free_list(&self) -> Result<(), ArenaError> {
        let mut cur = self.free_list_head().0;
        while cur != 0 {
            cur = self.free_node(cur)?.next;
        }
        Ok(())
    }

    /// Full structural check.
    ///
    /// Verifies the header, that the free list is ordered with no two
    /// adjacent nodes, that header, allocated blocks and free blocks tile the
    /// region exactly, that no allocated byte lies beyond the high-water
    /// mark, and that every small-block run agrees with its bitmap.
    pub fn validate(&self) -> Result<(), ArenaError> {
        let header = self.header()?;
        let capacity = header.full_size;
        if capacity as usize > self.region_len() {
            return Err(ArenaError::corrupted(
                0,
                format!("capacity {capacity} exceeds the region"),
            ));
        }
        if header.hwm < HEADER_SIZE || header.hwm > capacity {
            return Err(ArenaError::corrupted(
                0,
                format!("hwm {} outside [{HEADER_SIZE}, {capacity}]", header.hwm),
            ));
        }
        self.check_free_list()?;

        let free: SmallVec<[FreeBlock; 16]> = self.free_blocks().collect();
        for pair in free.windows(2) {
            if pair[0].end() == pair[1].offset.0 {
                return Err(ArenaError::corrupted(
                    pair[0].offset.0,
                    format!("free block touches the next one at {}", pair[1].offset),
                ));
            }
        }

        let mut pos = HEADER_SIZE;
        let mut free = free.iter().peekable();
        while pos < capacity {
            if let Some(block) = free.next_if(|b| b.offset.0 == pos) {
                pos = block.end();
                continue;
            }
            if pos as u64 + PREFIX_SIZE as u64 > capacity as u64 {
                return Err(ArenaError::corrupted(
                    pos,
                    format!("{} trailing bytes cannot hold a block prefix", capacity - pos),
                ));
            }
            let raw = self.load_u32(pos);
            let len = match BlockTag::decode(raw) {
                Some(BlockTag::Plain { len }) => len,
                _ => {
                    return Err(ArenaError::corrupted(
                        pos,
                        format!("expected a block prefix, found {raw:#010x}"),
                    ))
                }
            };
            let end = pos as u64 + PREFIX_SIZE as u64 + len as u64;
            if end > header.hwm as u64 {
                return Err(ArenaError::corrupted(
                    pos,
                    format!("block ends at {end}, beyond hwm {}", header.hwm),
                ));
            }
            if let Some(next) = free.peek() {
                if (next.offset.0 as u64) < end {
                    return Err(ArenaError::corrupted(
                        pos,
                        format!("block overlaps free block at {}", next.offset),
                    ));
                }
            }
            pos = end as u32;
        }
        if pos != capacity {
            return Err(ArenaError::corrupted(
                pos,
                format!("blocks end at {pos}, capacity is {capacity}"),
            ));
        }

        for class in SizeClass::ALL {
            self.validate_runs(class)?;
        }
        Ok(())
    }

    fn validate_runs(&self, class: SizeClass) -> Result<(), ArenaError> {
        for (index, run) in self.runs(class)?.into_iter().enumerate() {
            let at = run.offset.0;
            match self.block_tag(run.offset)? {
                BlockTag::Plain { len } if len >= class.run_size() => {}
                tag => {
                    return Err(ArenaError::corrupted(
                        at,
                        format!("run block {tag:?} too small for {class:?}"),
                    ))
                }
            }
            if run.slot_size as u32 != class.slot_size()
                || run.slots as u32 != class.slots_per_run()
            {
                return Err(ArenaError::corrupted(
                    at,
                    format!("run geometry {}x{} for {class:?}", run.slots, run.slot_size),
                ));
            }
            if run.bits >> run.slots != 0 {
                return Err(ArenaError::corrupted(at, "bits set past the last slot"));
            }
            if run.free as u32 != run.slots as u32 - run.bits.count_ones() {
                return Err(ArenaError::corrupted(
                    at,
                    format!("free count {} disagrees with bitmap {:#x}", run.free, run.bits),
                ));
            }
            for bit in 0..run.slots as u32 {
                if run.bits & (1 << bit) == 0 {
                    continue;
                }
                let slot = run.slot(bit);
                match self.block_tag(slot)? {
                    BlockTag::Small {
                        class: c,
                        run: r,
                        bit: b,
                        ..
                    } if c == class && r as usize == index && b as u32 == bit => {}
                    tag => {
                        return Err(ArenaError::corrupted(
                            slot.0 - PREFIX_SIZE,
                            format!("slot prefix {tag:?} does not match its run"),
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    /// A printable report of the header, free list and runs.
    pub fn dump(&self) -> ArenaDump<'_, 'a> {
        ArenaDump { arena: self }
    }

    /// Hex and ASCII listing of `len` bytes starting at `offset`, 16 bytes
    /// per line. The range is clipped to the arena.
    pub fn hexdump(&self, offset: Offset, len: u32) -> String {
        let bytes = self.as_bytes();
        let start = (offset.0 as usize).min(bytes.len());
        let end = start.saturating_add(len as usize).min(bytes.len());
        let mut out = String::new();
        for (i, line) in bytes[start..end].chunks(16).enumerate() {
            let _ = write!(out, "{:08x}: ", start + i * 16);
            for col in 0..16 {
                match line.get(col) {
                    Some(b) => {
                        let _ = write!(out, "{b:02x} ");
                    }
                    None => out.push_str("   "),
                }
            }
            out.push(' ');
            out.extend(line.iter().map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            }));
            out.push('\n');
        }
        out
    }
}

/// Display adapter returned by [`Arena::dump`].
pub struct ArenaDump<'b, 'a> {
    arena: &'b Arena<'a>,
}

impl fmt::Display for ArenaDump<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arena = self.arena;
        let header = match arena.header() {
            Ok(header) => header,
            Err(err) => return writeln!(f, "arena: {err}"),
        };
        writeln!(f, "arena:")?;
        writeln!(f, "  magic: {:#010x}", header.magic)?;
        writeln!(f, "  moveable: {}", header.is_moveable())?;
        writeln!(
            f,
            "  small blocks: {}",
            if header.small_blocks_enabled() {
                "enabled"
            } else {
                "disabled"
            }
        )?;
        writeln!(f, "  message: {}", header.message)?;
        writeln!(f, "  metadata: {}", header.metadata)?;
        writeln!(f, "  hwm: {}", header.hwm)?;
        writeln!(f, "  capacity: {}", header.full_size)?;
        writeln!(f, "  free list:")?;
        for block in arena.free_blocks() {
            writeln!(f, "    {}: {} bytes", block.offset, block.len)?;
        }
        for class in SizeClass::ALL {
            let runs = arena.runs(class).unwrap_or_default();
            writeln!(
                f,
                "  {}-byte runs: {} (registry {})",
                class.slot_size(),
                runs.len(),
                header.bitmaps[class.index()]
            )?;
            for run in runs {
                writeln!(
                    f,
                    "    {}: bits {:#010x} free {}/{}",
                    run.offset, run.bits, run.free, run.slots
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArenaConfig;
    use crate::freelist::AllocOptions;
    use crate::header::HWM_AT;

    #[test]
    fn fresh_arena_has_one_free_block() {
        let arena = Arena::with_capacity(4096).unwrap();
        let blocks: Vec<_> = arena.free_blocks().collect();
        assert_eq!(
            blocks,
            vec![FreeBlock {
                offset: Offset(HEADER_SIZE),
                len: 4096 - HEADER_SIZE,
            }]
        );
        assert_eq!(arena.free_bytes(), (4096 - HEADER_SIZE) as u64);
        arena.validate().unwrap();
    }

    #[test]
    fn full_arena_validates() {
        let mut arena = Arena::from_config(ArenaConfig {
            small_blocks: false,
            ..ArenaConfig::new(256)
        })
        .unwrap();
        arena
            .allocate_with(256 - HEADER_SIZE - PREFIX_SIZE, AllocOptions::plain().aligned(4))
            .unwrap();
        assert_eq!(arena.free_blocks().count(), 0);
        arena.validate().unwrap();
    }

    #[test]
    fn zero_length_node_is_corruption() {
        let mut arena = Arena::with_capacity(1024).unwrap();
        arena.store_u32(HEADER_SIZE, 0);
        assert!(matches!(
            arena.check_free_list(),
            Err(ArenaError::Corrupted { .. })
        ));
        assert!(arena.validate().is_err());
    }

    #[test]
    fn adjacent_free_blocks_are_corruption() {
        let mut arena = Arena::from_config(ArenaConfig {
            small_blocks: false,
            ..ArenaConfig::new(1024)
        })
        .unwrap();
        let a = arena.allocate(16).unwrap();
        let _b = arena.allocate(16).unwrap();
        arena.free(a).unwrap();
        // Split the hole by hand into two touching nodes.
        let at = a.0 - PREFIX_SIZE;
        arena.store_u32(at, 8);
        arena.store_u32(at + 4, at + 8);
        let tail = arena.free_blocks().nth(1).unwrap().offset.0;
        arena.store_u32(at + 8, 12);
        arena.store_u32(at + 12, tail);
        assert!(arena.check_free_list().is_ok());
        assert!(matches!(
            arena.validate(),
            Err(ArenaError::Corrupted { .. })
        ));
    }

    #[test]
    fn block_ending_short_of_capacity_is_corruption() {
        let mut arena = Arena::from_config(ArenaConfig {
            small_blocks: false,
            ..ArenaConfig::new(256)
        })
        .unwrap();
        let a = arena.allocate_with(8, AllocOptions::plain()).unwrap();
        // Stretch the block to end two bytes before capacity, leaving a
        // tail too short for another prefix.
        arena.store_u32(a.0 - PREFIX_SIZE, 256 - 2 - a.0);
        arena.store_u32(HWM_AT, 256);
        arena.set_free_list_head(0);
        let reopened = Arena::open_owned(arena.into_bytes()).unwrap();
        assert!(matches!(
            reopened.validate(),
            Err(ArenaError::Corrupted { offset: Offset(254), .. })
        ));
    }

    #[test]
    fn tampered_run_counter_is_corruption() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        arena.allocate(8).unwrap();
        let run = arena.runs(SizeClass::Slot16).unwrap()[0];
        arena.store_u8(run.offset.0 + 6, 20);
        assert!(matches!(
            arena.validate(),
            Err(ArenaError::Corrupted { .. })
        ));
    }

    #[test]
    fn dump_lists_header_and_free_list() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        arena.allocate(20).unwrap();
        let text = arena.dump().to_string();
        assert!(text.contains("capacity: 4096"));
        assert!(text.contains("small blocks: enabled"));
        assert!(text.contains("32-byte runs: 1"));
        assert!(text.contains("free list:"));
    }

    #[test]
    fn hexdump_formats_lines() {
        let mut arena = Arena::with_capacity(1024).unwrap();
        arena.write(Offset(64), u32::from_le_bytes(*b"ABCD")).unwrap();
        let text = arena.hexdump(Offset(64), 20);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000040: 41 42 43 44 "));
        assert!(lines[0].ends_with("ABCD............"));
        assert!(lines[1].starts_with("00000050: "));
    }
}
