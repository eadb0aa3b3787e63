//! A shadow model of live arena allocations.
//!
//! Every block handed out through the model is filled with a distinct byte
//! pattern and the expected contents are kept in an [`IndexMap`] keyed by
//! offset. Insertion order is stable, so a test driven by random indices
//! replays identically.

use indexmap::IndexMap;
use toolbelt_arena::block::PREFIX_SIZE;
use toolbelt_arena::{AllocOptions, Arena, ArenaError, Offset};

/// Expected contents of every live allocation.
#[derive(Debug, Default)]
pub struct ShadowHeap {
    live: IndexMap<Offset, Vec<u8>>,
    issued: usize,
}

impl ShadowHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn offsets(&self) -> impl Iterator<Item = Offset> + '_ {
        self.live.keys().copied()
    }

    fn fill(&mut self, arena: &mut Arena<'_>, offset: Offset, size: u32) -> Vec<u8> {
        self.issued += 1;
        let byte = crate::pattern(self.issued);
        let expected = vec![byte; size as usize];
        arena
            .bytes_mut(offset, size)
            .expect("fresh block resolves")
            .copy_from_slice(&expected);
        expected
    }

    /// Allocate, fill with a fresh pattern and record.
    pub fn allocate(
        &mut self,
        arena: &mut Arena<'_>,
        size: u32,
        opts: AllocOptions,
    ) -> Result<Offset, ArenaError> {
        let offset = arena.allocate_with(size, opts)?;
        if opts.clear {
            let bytes = arena.bytes(offset, size).expect("fresh block resolves");
            assert!(bytes.iter().all(|&b| b == 0), "cleared block at {offset} is dirty");
        }
        let expected = self.fill(arena, offset, size);
        let previous = self.live.insert(offset, expected);
        assert!(previous.is_none(), "offset {offset} handed out twice");
        Ok(offset)
    }

    /// Free the `index`th live allocation.
    pub fn free(&mut self, arena: &mut Arena<'_>, index: usize) -> Result<Offset, ArenaError> {
        let (offset, _) = self
            .live
            .swap_remove_index(index)
            .expect("index within live set");
        arena.free(offset)?;
        Ok(offset)
    }

    /// Resize the `index`th live allocation, checking that the kept prefix
    /// survived and, with `clear`, that bytes past the old block read as
    /// zero.
    pub fn realloc(
        &mut self,
        arena: &mut Arena<'_>,
        index: usize,
        size: u32,
        opts: AllocOptions,
    ) -> Result<Offset, ArenaError> {
        let (old, expected) = self
            .live
            .swap_remove_index(index)
            .expect("index within live set");
        let old_len = arena.block(old).map_or(0, |b| b.len());
        let new = match arena.realloc_with(old, size, opts) {
            Ok(new) => new,
            Err(err) => {
                // A failed realloc leaves the block untouched.
                self.live.insert(old, expected);
                return Err(err);
            }
        };
        let keep = expected.len().min(size as usize);
        let bytes = arena.bytes(new, size).expect("resized block resolves");
        assert_eq!(&bytes[..keep], &expected[..keep], "realloc lost data at {new}");
        if opts.clear {
            let from = old_len.min(size as usize);
            assert!(
                bytes[from..].iter().all(|&b| b == 0),
                "realloc extension at {new} is dirty"
            );
        }
        let refreshed = self.fill(arena, new, size);
        let previous = self.live.insert(new, refreshed);
        assert!(previous.is_none(), "offset {new} handed out twice");
        Ok(new)
    }

    /// Check every live block's contents and that no two blocks overlap.
    pub fn verify(&self, arena: &Arena<'_>) {
        let mut spans = Vec::with_capacity(self.live.len());
        for (&offset, expected) in &self.live {
            let block = arena
                .block(offset)
                .unwrap_or_else(|| panic!("live block {offset} does not resolve"));
            assert!(block.len() >= expected.len(), "block {offset} shrank");
            assert_eq!(&block[..expected.len()], &expected[..], "block {offset} corrupted");
            spans.push((offset.0 - PREFIX_SIZE, offset.0 + block.len() as u32));
        }
        spans.sort_unstable();
        for pair in spans.windows(2) {
            assert!(
                pair[0].1 <= pair[1].0,
                "blocks {:?} and {:?} overlap",
                pair[0],
                pair[1]
            );
        }
    }
}
