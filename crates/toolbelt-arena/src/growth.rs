//! Growth strategies for relocatable arenas.
//!
//! When the free list is exhausted, a growable arena asks its strategy to
//! enlarge the backing `Vec<u8>` from `old_size` to at least `new_size`
//! bytes, preserving the existing contents. The `Vec` may move; the arena
//! only ever stores offsets, so nothing inside it needs fixing up. Adding
//! the new memory to the free list is the arena's job, not the strategy's.

use crate::config::ArenaConfig;
use crate::error::ArenaError;

/// Enlarges the memory behind a growable arena.
pub trait GrowthStrategy {
    /// Grow `memory` to at least `new_size` bytes, keeping the first
    /// `old_size` bytes intact.
    fn grow(
        &mut self,
        memory: &mut Vec<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<(), ArenaError>;
}

impl<F> GrowthStrategy for F
where
    F: FnMut(&mut Vec<u8>, usize, usize) -> Result<(), ArenaError>,
{
    fn grow(
        &mut self,
        memory: &mut Vec<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<(), ArenaError> {
        self(memory, old_size, new_size)
    }
}

/// The default strategy: reallocate the `Vec`, refusing past a ceiling.
#[derive(Clone, Debug)]
pub struct ReallocGrowth {
    ceiling: u32,
}

impl ReallocGrowth {
    /// Grow without a ceiling below [`ArenaConfig::MAX_CAPACITY`].
    pub fn new() -> Self {
        Self {
            ceiling: ArenaConfig::MAX_CAPACITY,
        }
    }

    /// Grow up to at most `ceiling` bytes.
    pub fn with_ceiling(ceiling: u32) -> Self {
        Self {
            ceiling: ceiling.min(ArenaConfig::MAX_CAPACITY),
        }
    }

    /// The largest capacity this strategy will provide.
    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }
}

impl Default for ReallocGrowth {
    fn default() -> Self {
        Self::new()
    }
}

impl GrowthStrategy for ReallocGrowth {
    fn grow(
        &mut self,
        memory: &mut Vec<u8>,
        _old_size: usize,
        new_size: usize,
    ) -> Result<(), ArenaError> {
        if new_size > self.ceiling as usize {
            return Err(ArenaError::GrowthFailed {
                requested: new_size as u64,
                reason: format!("ceiling is {} bytes", self.ceiling),
            });
        }
        memory.resize(new_size, 0);
        Ok(())
    }
}
