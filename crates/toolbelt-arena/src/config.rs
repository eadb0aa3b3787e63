//! Arena configuration parameters.

use crate::block::FREE_HEADER_SIZE;
use crate::error::ArenaError;
use crate::header::HEADER_SIZE;

/// Configuration for an owned arena built by [`Arena::from_config`].
///
/// [`Arena::from_config`]: crate::Arena::from_config
#[derive(Clone, Debug)]
pub struct ArenaConfig {
    /// Initial capacity in bytes, header included.
    ///
    /// Default: 4096. Must leave room for the header and one free block.
    pub capacity: u32,

    /// Route requests of up to 128 bytes through the small-block allocator.
    ///
    /// Default: true.
    pub small_blocks: bool,

    /// Attach a [`ReallocGrowth`] strategy so the arena doubles on exhaustion.
    ///
    /// Default: false (fixed capacity).
    ///
    /// [`ReallocGrowth`]: crate::growth::ReallocGrowth
    pub growable: bool,

    /// Ceiling for growth, in bytes. Ignored for fixed arenas.
    ///
    /// Default: [`ArenaConfig::MAX_CAPACITY`].
    pub max_capacity: u32,
}

impl ArenaConfig {
    /// Default initial capacity.
    pub const DEFAULT_CAPACITY: u32 = 4096;

    /// Largest capacity any arena may reach. Plain block lengths must leave
    /// the top prefix bit clear for the small-block tag.
    pub const MAX_CAPACITY: u32 = 1 << 31;

    /// Smallest usable capacity: the header plus one free-list node.
    pub const MIN_CAPACITY: u32 = HEADER_SIZE + FREE_HEADER_SIZE;

    /// Create a fixed-capacity config with small blocks enabled.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            small_blocks: true,
            growable: false,
            max_capacity: Self::MAX_CAPACITY,
        }
    }

    /// Create a growable config starting at `capacity`.
    pub fn growable(capacity: u32) -> Self {
        Self {
            growable: true,
            ..Self::new(capacity)
        }
    }

    /// Check the parameters, returning `InvalidConfig` on the first problem.
    pub fn validate(&self) -> Result<(), ArenaError> {
        validate_capacity(self.capacity as u64)?;
        if self.growable && self.max_capacity < self.capacity {
            return Err(ArenaError::InvalidConfig {
                reason: format!(
                    "max_capacity {} is below the initial capacity {}",
                    self.max_capacity, self.capacity
                ),
            });
        }
        if self.max_capacity > Self::MAX_CAPACITY {
            return Err(ArenaError::InvalidConfig {
                reason: format!(
                    "max_capacity {} exceeds the {}-byte limit",
                    self.max_capacity,
                    Self::MAX_CAPACITY
                ),
            });
        }
        Ok(())
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

pub(crate) fn validate_capacity(capacity: u64) -> Result<(), ArenaError> {
    if capacity < ArenaConfig::MIN_CAPACITY as u64 {
        return Err(ArenaError::InvalidConfig {
            reason: format!(
                "capacity {capacity} is below the minimum of {} bytes",
                ArenaConfig::MIN_CAPACITY
            ),
        });
    }
    if capacity > ArenaConfig::MAX_CAPACITY as u64 {
        return Err(ArenaError::InvalidConfig {
            reason: format!(
                "capacity {capacity} exceeds the {}-byte limit",
                ArenaConfig::MAX_CAPACITY
            ),
        });
    }
    Ok(())
}
