//! Arena-relative offsets and fixed-width scalar encoding.
//!
//! Every reference stored inside an arena is an [`Offset`] from the arena
//! base, never an address: any allocation may relocate the whole region.
//! Values are stored little-endian through the [`Scalar`] trait so a laid-out
//! arena can be written to disk or shared memory and reopened elsewhere.

use std::fmt;

/// An arena-relative byte offset. `Offset(0)` is the null reference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Offset(pub u32);

impl Offset {
    /// The null offset.
    pub const NULL: Offset = Offset(0);

    /// Whether this is the null offset.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The raw offset value.
    pub fn get(self) -> u32 {
        self.0
    }

    /// This offset advanced by `bytes`, or `None` on overflow.
    pub fn checked_add(self, bytes: u32) -> Option<Offset> {
        self.0.checked_add(bytes).map(Offset)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u32> for Offset {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<Offset> for u32 {
    fn from(v: Offset) -> Self {
        v.0
    }
}

/// A fixed-width value that can live inside an arena.
///
/// `decode` and `encode` always receive a slice of exactly `WIDTH` bytes.
pub trait Scalar: Copy + Default {
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Read a value from `WIDTH` little-endian bytes.
    fn decode(bytes: &[u8]) -> Self;

    /// Write the value as `WIDTH` little-endian bytes.
    fn encode(self, bytes: &mut [u8]);
}

macro_rules! impl_scalar {
    ($($t:ty),* $(,)?) => {
        $(
            impl Scalar for $t {
                const WIDTH: usize = std::mem::size_of::<$t>();

                fn decode(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    <$t>::from_le_bytes(buf)
                }

                fn encode(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_scalar!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl Scalar for Offset {
    const WIDTH: usize = 4;

    fn decode(bytes: &[u8]) -> Self {
        Offset(u32::decode(bytes))
    }

    fn encode(self, bytes: &mut [u8]) {
        self.0.encode(bytes);
    }
}
