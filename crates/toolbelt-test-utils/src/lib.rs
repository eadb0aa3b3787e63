//! Test fixtures for toolbelt-arena.
//!
//! Provides arena builders, a [`RecordingGrowth`] strategy that logs every
//! resize, and a [`ShadowHeap`] that mirrors live allocations outside the
//! arena so tests can check contents and layout after arbitrary operation
//! sequences.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod shadow;

use std::cell::RefCell;
use std::rc::Rc;

use toolbelt_arena::{Arena, ArenaConfig, ArenaError, GrowthStrategy};

pub use shadow::ShadowHeap;

/// Owned, fixed-capacity arena with the small-block allocator switched off,
/// so every request goes through the free list.
pub fn plain_arena(capacity: u32) -> Arena<'static> {
    Arena::from_config(ArenaConfig {
        small_blocks: false,
        ..ArenaConfig::new(capacity)
    })
    .expect("valid test capacity")
}

/// Owned, fixed-capacity arena with small blocks enabled.
pub fn small_block_arena(capacity: u32) -> Arena<'static> {
    Arena::with_capacity(capacity).expect("valid test capacity")
}

/// Growth strategy that resizes the `Vec` and records each `(old, new)`
/// request. Clones share the log.
#[derive(Clone, Default)]
pub struct RecordingGrowth {
    log: Rc<RefCell<Vec<(usize, usize)>>>,
    limit: Option<usize>,
}

impl RecordingGrowth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse any request for more than `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Every `(old_size, new_size)` request seen so far, refused ones
    /// included.
    pub fn calls(&self) -> Vec<(usize, usize)> {
        self.log.borrow().clone()
    }
}

impl GrowthStrategy for RecordingGrowth {
    fn grow(
        &mut self,
        memory: &mut Vec<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<(), ArenaError> {
        self.log.borrow_mut().push((old_size, new_size));
        if self.limit.is_some_and(|limit| new_size > limit) {
            return Err(ArenaError::GrowthFailed {
                requested: new_size as u64,
                reason: "recording strategy limit".to_string(),
            });
        }
        memory.resize(new_size, 0);
        Ok(())
    }
}

/// Deterministic fill byte for the `n`th allocation.
pub fn pattern(n: usize) -> u8 {
    (n.wrapping_mul(37) % 251) as u8 + 1
}
