//! Arena-specific error types.

use std::error::Error;
use std::fmt;

use crate::offset::Offset;

/// Errors that can occur during arena operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArenaError {
    /// No free block fits and the arena cannot (or may not) grow.
    OutOfMemory {
        /// Number of bytes requested, including the block prefix.
        requested: u64,
        /// Capacity of the arena at the time of the request.
        capacity: u32,
    },
    /// An offset that does not resolve to a valid location in the arena.
    InvalidOffset {
        /// The offending offset.
        offset: Offset,
    },
    /// The header magic is not one of the known arena tags.
    InvalidMagic {
        /// The magic value found at offset 0.
        magic: u32,
    },
    /// Construction parameters were rejected.
    InvalidConfig {
        /// Human-readable description of what was wrong.
        reason: String,
    },
    /// Alignment must be a non-zero power of two.
    InvalidAlignment {
        /// The rejected alignment.
        alignment: u32,
    },
    /// A zero-byte allocation was requested.
    ZeroSize,
    /// An element index past the end of a vector.
    IndexOutOfBounds {
        /// The requested index.
        index: u32,
        /// The vector's element count.
        len: u32,
    },
    /// The growth strategy could not provide the requested memory.
    GrowthFailed {
        /// The capacity the arena asked for.
        requested: u64,
        /// Why the strategy refused.
        reason: String,
    },
    /// A block was freed twice.
    DoubleFree {
        /// Offset of the block being freed.
        offset: Offset,
    },
    /// Arena metadata is inconsistent. The arena must not be used further.
    Corrupted {
        /// Where the inconsistency was detected.
        offset: Offset,
        /// What was wrong.
        reason: String,
    },
}

impl ArenaError {
    pub(crate) fn corrupted(offset: u32, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            offset: Offset(offset),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                capacity,
            } => {
                write!(
                    f,
                    "arena out of memory: requested {requested} bytes, capacity {capacity} bytes"
                )
            }
            Self::InvalidOffset { offset } => write!(f, "invalid arena offset {offset}"),
            Self::InvalidMagic { magic } => write!(f, "invalid arena magic {magic:#010x}"),
            Self::InvalidConfig { reason } => write!(f, "invalid arena config: {reason}"),
            Self::InvalidAlignment { alignment } => {
                write!(f, "alignment {alignment} is not a power of two")
            }
            Self::ZeroSize => write!(f, "zero-sized allocation"),
            Self::IndexOutOfBounds { index, len } => {
                write!(f, "index {index} out of bounds for vector of length {len}")
            }
            Self::GrowthFailed { requested, reason } => {
                write!(f, "arena growth to {requested} bytes failed: {reason}")
            }
            Self::DoubleFree { offset } => write!(f, "block at {offset} freed twice"),
            Self::Corrupted { offset, reason } => {
                write!(f, "arena corrupted at {offset}: {reason}")
            }
        }
    }
}

impl Error for ArenaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_sizes() {
        let err = ArenaError::OutOfMemory {
            requested: 132,
            capacity: 256,
        };
        assert_eq!(
            err.to_string(),
            "arena out of memory: requested 132 bytes, capacity 256 bytes"
        );
    }

    #[test]
    fn magic_is_printed_in_hex() {
        let err = ArenaError::InvalidMagic { magic: 0xdead_beef };
        assert_eq!(err.to_string(), "invalid arena magic 0xdeadbeef");
    }
}
