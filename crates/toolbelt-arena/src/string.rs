//! Length-prefixed strings.
//!
//! A string field is a 4-byte slot holding the offset of a block laid out as
//! `len: u32` followed by `len` bytes. The block never comes from the
//! small-block allocator.

use crate::arena::Arena;
use crate::error::ArenaError;
use crate::freelist::AllocOptions;
use crate::offset::Offset;

const LEN_SIZE: u32 = 4;

impl Arena<'_> {
    /// Store `s` in the string whose slot is at `header`, reusing the
    /// existing block when there is one. Returns the block offset.
    pub fn set_string(&mut self, header: Offset, s: &[u8]) -> Result<Offset, ArenaError> {
        let block = self.string_block(header, s.len(), false)?;
        if !s.is_empty() {
            self.bytes_mut(Offset(block.0 + LEN_SIZE), s.len() as u32)
                .ok_or(ArenaError::InvalidOffset { offset: block })?
                .copy_from_slice(s);
        }
        Ok(block)
    }

    /// Size the string at `header` to `len` bytes and return them for the
    /// caller to fill in.
    pub fn allocate_string(
        &mut self,
        header: Offset,
        len: u32,
        clear: bool,
    ) -> Result<&mut [u8], ArenaError> {
        let block = self.string_block(header, len as usize, clear)?;
        if len == 0 {
            return Ok(&mut []);
        }
        self.bytes_mut(Offset(block.0 + LEN_SIZE), len)
            .ok_or(ArenaError::InvalidOffset { offset: block })
    }

    fn string_block(
        &mut self,
        header: Offset,
        len: usize,
        clear: bool,
    ) -> Result<Offset, ArenaError> {
        let existing: Offset = self
            .read(header)
            .ok_or(ArenaError::InvalidOffset { offset: header })?;
        let size = u32::try_from(len)
            .ok()
            .and_then(|n| n.checked_add(LEN_SIZE))
            .ok_or_else(|| self.out_of_memory(len as u64))?;
        let opts = AllocOptions::plain().aligned(4).cleared(clear);
        let block = if existing.is_null() {
            self.allocate_with(size, opts)?
        } else {
            self.realloc_with(existing, size, opts)?
        };
        self.write(block, size - LEN_SIZE)?;
        // The arena may have moved; the slot is re-resolved by offset.
        self.write(header, block)?;
        Ok(block)
    }

    /// The bytes of the string at `header`, or `None` if it was never set.
    pub fn get_string(&self, header: Offset) -> Option<&[u8]> {
        let block: Offset = self.read(header)?;
        if block.is_null() {
            return None;
        }
        let len: u32 = self.read(block)?;
        if len == 0 {
            return Some(&[]);
        }
        self.bytes(Offset(block.0 + LEN_SIZE), len)
    }

    /// The string at `header` as UTF-8.
    pub fn get_str(&self, header: Offset) -> Option<&str> {
        std::str::from_utf8(self.get_string(header)?).ok()
    }

    /// Length of the string at `header`; 0 if unset.
    pub fn string_len(&self, header: Offset) -> u32 {
        self.read::<Offset>(header)
            .filter(|block| !block.is_null())
            .and_then(|block| self.read::<u32>(block))
            .unwrap_or(0)
    }

    /// Free the string at `header` and null its slot.
    pub fn clear_string(&mut self, header: Offset) -> Result<(), ArenaError> {
        let block: Offset = self
            .read(header)
            .ok_or(ArenaError::InvalidOffset { offset: header })?;
        self.free(block)?;
        self.write(header, Offset::NULL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with_slot() -> (Arena<'static>, Offset) {
        let mut arena = Arena::with_capacity(4096).unwrap();
        let slot = arena.allocate_with(8, AllocOptions::plain()).unwrap();
        (arena, slot)
    }

    #[test]
    fn unset_string_reads_as_none() {
        let (arena, slot) = arena_with_slot();
        assert_eq!(arena.get_string(slot), None);
        assert_eq!(arena.string_len(slot), 0);
    }

    #[test]
    fn set_and_get() {
        let (mut arena, slot) = arena_with_slot();
        let block = arena.set_string(slot, b"foobar").unwrap();
        assert_eq!(arena.read::<Offset>(slot), Some(block));
        assert_eq!(arena.read::<u32>(block), Some(6));
        assert_eq!(arena.get_str(slot), Some("foobar"));
        assert_eq!(arena.string_len(slot), 6);
        assert!(!arena.block_tag(block).unwrap().is_small());
    }

    #[test]
    fn replace_with_longer_string() {
        let (mut arena, slot) = arena_with_slot();
        arena.set_string(slot, b"foobar").unwrap();
        arena.set_string(slot, b"foobar has been replaced").unwrap();
        assert_eq!(arena.get_str(slot), Some("foobar has been replaced"));
        assert_eq!(arena.string_len(slot), 24);
        arena.validate().unwrap();
    }

    #[test]
    fn empty_string() {
        let (mut arena, slot) = arena_with_slot();
        arena.set_string(slot, b"").unwrap();
        assert_eq!(arena.get_string(slot), Some(&b""[..]));
    }

    #[test]
    fn allocate_string_returns_writable_span() {
        let (mut arena, slot) = arena_with_slot();
        arena.allocate_string(slot, 5, true).unwrap().copy_from_slice(b"hello");
        assert_eq!(arena.get_str(slot), Some("hello"));
        let span = arena.allocate_string(slot, 8, true).unwrap();
        assert_eq!(&span[..5], b"hello");
        assert_eq!(&span[5..], &[0, 0, 0]);
    }

    #[test]
    fn clear_string_frees_block() {
        let (mut arena, slot) = arena_with_slot();
        arena.set_string(slot, b"transient").unwrap();
        arena.clear_string(slot).unwrap();
        assert_eq!(arena.get_string(slot), None);
        arena.clear_string(slot).unwrap();
        arena.validate().unwrap();
    }

    #[test]
    fn invalid_utf8_is_not_a_str() {
        let (mut arena, slot) = arena_with_slot();
        arena.set_string(slot, &[0xff, 0xfe]).unwrap();
        assert_eq!(arena.get_str(slot), None);
        assert_eq!(arena.get_string(slot), Some(&[0xff, 0xfe][..]));
    }
}
