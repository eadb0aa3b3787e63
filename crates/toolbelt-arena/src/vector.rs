//! Growable vectors stored inside the arena.
//!
//! A vector is an 8-byte header (`num_elements: u32`, `data: Offset`)
//! embedded in some larger structure, usually a message. The element storage
//! is an ordinary allocated block; capacity is read back from its prefix, so
//! nothing but the count and the data offset is stored.

use std::fmt;
use std::marker::PhantomData;

use crate::arena::Arena;
use crate::error::ArenaError;
use crate::freelist::AllocOptions;
use crate::offset::{Offset, Scalar};

/// Typed reference to a vector header inside an arena.
///
/// A handle is only an offset; it stays valid across relocation.
pub struct VectorHandle<T> {
    header: Offset,
    _marker: PhantomData<fn() -> T>,
}

impl<T> VectorHandle<T> {
    /// Size of the header a handle points at.
    pub const HEADER_SIZE: u32 = 8;

    /// Refer to the vector header at `header`.
    pub fn new(header: Offset) -> Self {
        Self {
            header,
            _marker: PhantomData,
        }
    }

    /// Offset of the header.
    pub fn header(self) -> Offset {
        self.header
    }
}

impl<T> Clone for VectorHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for VectorHandle<T> {}

impl<T> PartialEq for VectorHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
    }
}

impl<T> Eq for VectorHandle<T> {}

impl<T> fmt::Debug for VectorHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VectorHandle").field(&self.header).finish()
    }
}

fn byte_len<T: Scalar>(elements: u32) -> Option<u32> {
    elements.checked_mul(T::WIDTH as u32)
}

impl Arena<'_> {
    /// Allocate a zeroed, stand-alone vector header.
    pub fn allocate_vector<T: Scalar>(&mut self) -> Result<VectorHandle<T>, ArenaError> {
        let header = self.allocate_with(
            VectorHandle::<T>::HEADER_SIZE,
            AllocOptions::plain().aligned(4),
        )?;
        Ok(VectorHandle::new(header))
    }

    fn vector_header<T>(&self, v: VectorHandle<T>) -> Result<(u32, Offset), ArenaError> {
        let count = self.read::<u32>(v.header);
        let data = v.header.checked_add(4).and_then(|at| self.read::<Offset>(at));
        match (count, data) {
            (Some(count), Some(data)) => Ok((count, data)),
            _ => Err(ArenaError::InvalidOffset { offset: v.header }),
        }
    }

    fn store_vector_header<T>(
        &mut self,
        v: VectorHandle<T>,
        count: u32,
        data: Offset,
    ) -> Result<(), ArenaError> {
        self.write(v.header, count)?;
        self.write(Offset(v.header.0 + 4), data)
    }

    /// Number of elements. An unresolvable header reads as empty.
    pub fn vector_len<T>(&self, v: VectorHandle<T>) -> u32 {
        self.read::<u32>(v.header).unwrap_or(0)
    }

    /// Elements the current storage holds without reallocating.
    pub fn vector_capacity<T: Scalar>(&self, v: VectorHandle<T>) -> u32 {
        match self.vector_header(v) {
            Ok((_, data)) if !data.is_null() => self
                .block_tag(data)
                .map_or(0, |tag| tag.len() / T::WIDTH as u32),
            _ => 0,
        }
    }

    /// Append `value`, doubling the storage when it is full.
    pub fn vector_push<T: Scalar>(&mut self, v: VectorHandle<T>, value: T) -> Result<(), ArenaError> {
        self.vector_push_with(v, value, AllocOptions::default())
    }

    /// Append `value`, allocating storage with `opts`.
    pub fn vector_push_with<T: Scalar>(
        &mut self,
        v: VectorHandle<T>,
        value: T,
        opts: AllocOptions,
    ) -> Result<(), ArenaError> {
        let (count, data) = self.vector_header(v)?;
        let data = if data.is_null() {
            let size = byte_len::<T>(2).ok_or_else(|| self.out_of_memory(u64::MAX))?;
            self.allocate_with(size, opts)?
        } else if count >= self.vector_capacity(v) {
            let size = count
                .checked_mul(2)
                .map(|n| n.max(2))
                .and_then(byte_len::<T>)
                .ok_or_else(|| self.out_of_memory(u64::MAX))?;
            self.realloc_with(data, size, opts)?
        } else {
            data
        };
        let slot = byte_len::<T>(count)
            .and_then(|at| data.checked_add(at))
            .ok_or(ArenaError::InvalidOffset { offset: data })?;
        self.write(slot, value)?;
        self.store_vector_header(v, count + 1, data)
    }

    /// Element `index`, or `None` past the end.
    pub fn vector_get<T: Scalar>(&self, v: VectorHandle<T>, index: u32) -> Option<T> {
        let (count, data) = self.vector_header(v).ok()?;
        if index >= count {
            return None;
        }
        self.read(data.checked_add(byte_len::<T>(index)?)?)
    }

    /// Overwrite element `index`.
    pub fn vector_set<T: Scalar>(
        &mut self,
        v: VectorHandle<T>,
        index: u32,
        value: T,
    ) -> Result<(), ArenaError> {
        let (count, data) = self.vector_header(v)?;
        if index >= count {
            return Err(ArenaError::IndexOutOfBounds { index, len: count });
        }
        let slot = byte_len::<T>(index)
            .and_then(|at| data.checked_add(at))
            .ok_or(ArenaError::InvalidOffset { offset: data })?;
        self.write(slot, value)
    }

    /// Make room for at least `n` elements without changing the count.
    pub fn vector_reserve<T: Scalar>(&mut self, v: VectorHandle<T>, n: u32) -> Result<(), ArenaError> {
        self.vector_reserve_with(v, n, AllocOptions::default().cleared(false))
    }

    /// [`Arena::vector_reserve`] with explicit allocation options.
    pub fn vector_reserve_with<T: Scalar>(
        &mut self,
        v: VectorHandle<T>,
        n: u32,
        opts: AllocOptions,
    ) -> Result<(), ArenaError> {
        if n == 0 || self.vector_capacity(v) >= n {
            return Ok(());
        }
        let (count, data) = self.vector_header(v)?;
        let size = byte_len::<T>(n).ok_or_else(|| self.out_of_memory(u64::MAX))?;
        let data = if data.is_null() {
            self.allocate_with(size, opts)?
        } else {
            self.realloc_with(data, size, opts)?
        };
        self.store_vector_header(v, count, data)
    }

    /// Set the element count to `n`. New elements read as zero; shrinking
    /// hands the unused tail of the storage back to the arena, and `n == 0`
    /// releases the storage altogether.
    pub fn vector_resize<T: Scalar>(&mut self, v: VectorHandle<T>, n: u32) -> Result<(), ArenaError> {
        if n == 0 {
            return self.vector_clear(v);
        }
        let (count, data) = self.vector_header(v)?;
        let size = byte_len::<T>(n).ok_or_else(|| self.out_of_memory(u64::MAX))?;
        let data = if data.is_null() {
            self.allocate_with(size, AllocOptions::default())?
        } else if n != count {
            self.realloc_with(data, size, AllocOptions::default())?
        } else {
            data
        };
        if n > count {
            // Storage past the old count may hold stale elements.
            let from = byte_len::<T>(count).unwrap_or(0);
            let stale = self
                .bytes_mut(Offset(data.0 + from), size - from)
                .ok_or(ArenaError::InvalidOffset { offset: data })?;
            stale.fill(0);
        }
        self.store_vector_header(v, n, data)
    }

    /// Release the storage and reset the header to empty.
    pub fn vector_clear<T>(&mut self, v: VectorHandle<T>) -> Result<(), ArenaError> {
        let (_, data) = self.vector_header(v)?;
        self.free(data)?;
        self.store_vector_header(v, 0, Offset::NULL)
    }

    /// Copy the elements out.
    pub fn vector_to_vec<T: Scalar>(&self, v: VectorHandle<T>) -> Vec<T> {
        (0..self.vector_len(v))
            .map_while(|i| self.vector_get(v, i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::SizeClass;
    use crate::block::BlockTag;

    #[test]
    fn push_and_get() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        let v = arena.allocate_vector::<u32>().unwrap();
        assert_eq!(arena.vector_len(v), 0);
        assert_eq!(arena.vector_capacity(v), 0);
        for i in 0..5 {
            arena.vector_push(v, i * 10).unwrap();
        }
        assert_eq!(arena.vector_len(v), 5);
        assert_eq!(arena.vector_get(v, 3), Some(30));
        assert_eq!(arena.vector_get(v, 5), None);
        assert_eq!(arena.vector_to_vec(v), vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn first_push_allocates_two() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        let v = arena.allocate_vector::<u64>().unwrap();
        arena.vector_push(v, 1u64).unwrap();
        assert_eq!(arena.vector_capacity(v), 2);
    }

    #[test]
    fn capacity_doubles() {
        let mut arena = Arena::with_capacity(8192).unwrap();
        let v = arena.allocate_vector::<u32>().unwrap();
        let mut seen = Vec::new();
        for i in 0..40u32 {
            arena.vector_push(v, i).unwrap();
            let cap = arena.vector_capacity(v);
            if seen.last() != Some(&cap) {
                seen.push(cap);
            }
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 32, 64]);
        assert_eq!(arena.vector_to_vec(v), (0..40).collect::<Vec<_>>());
        arena.validate().unwrap();
    }

    #[test]
    fn small_storage_moves_to_free_list() {
        let mut arena = Arena::with_capacity(8192).unwrap();
        let v = arena.allocate_vector::<u64>().unwrap();
        for i in 0..20u64 {
            arena.vector_push(v, i).unwrap();
        }
        let (_, data) = arena.vector_header(v).unwrap();
        assert!(!arena.block_tag(data).unwrap().is_small());
        // All earlier storage went back to its runs.
        for class in SizeClass::ALL {
            for run in arena.runs(class).unwrap() {
                assert_eq!(run.free, run.slots);
            }
        }
    }

    #[test]
    fn set_checks_bounds() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        let v = arena.allocate_vector::<i16>().unwrap();
        arena.vector_push(v, 1i16).unwrap();
        arena.vector_set(v, 0, -7).unwrap();
        assert_eq!(arena.vector_get(v, 0), Some(-7));
        assert_eq!(
            arena.vector_set(v, 1, 0),
            Err(ArenaError::IndexOutOfBounds { index: 1, len: 1 })
        );
    }

    #[test]
    fn reserve_keeps_count() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        let v = arena.allocate_vector::<u32>().unwrap();
        arena.vector_push(v, 9).unwrap();
        arena.vector_reserve(v, 50).unwrap();
        assert_eq!(arena.vector_len(v), 1);
        assert!(arena.vector_capacity(v) >= 50);
        assert_eq!(arena.vector_get(v, 0), Some(9));
    }

    #[test]
    fn resize_grows_with_zeros_and_shrinks() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        let v = arena.allocate_vector::<u32>().unwrap();
        for i in 1..=4 {
            arena.vector_push(v, i).unwrap();
        }
        arena.vector_resize(v, 2).unwrap();
        assert_eq!(arena.vector_to_vec(v), vec![1, 2]);
        arena.vector_resize(v, 6).unwrap();
        assert_eq!(arena.vector_to_vec(v), vec![1, 2, 0, 0, 0, 0]);
        arena.vector_resize(v, 0).unwrap();
        assert_eq!(arena.vector_len(v), 0);
        assert_eq!(arena.vector_capacity(v), 0);
    }

    #[test]
    fn resize_shrink_releases_tail() {
        let mut arena = Arena::with_capacity(8192).unwrap();
        let v = arena.allocate_vector::<u64>().unwrap();
        arena.vector_resize(v, 100).unwrap();
        let (_, data) = arena.vector_header(v).unwrap();
        assert_eq!(arena.block_tag(data).unwrap(), BlockTag::Plain { len: 800 });
        arena.vector_resize(v, 40).unwrap();
        assert_eq!(arena.block_tag(data).unwrap(), BlockTag::Plain { len: 320 });
        arena.validate().unwrap();
    }

    #[test]
    fn clear_frees_storage() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        let v = arena.allocate_vector::<u32>().unwrap();
        arena.vector_resize(v, 100).unwrap();
        let before = arena.free_blocks().count();
        arena.vector_clear(v).unwrap();
        assert_eq!(arena.vector_len(v), 0);
        assert!(arena.free_blocks().count() <= before);
        arena.validate().unwrap();
    }

    #[test]
    fn offsets_are_scalars() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        let v = arena.allocate_vector::<Offset>().unwrap();
        arena.vector_push(v, Offset(0x100)).unwrap();
        assert_eq!(arena.vector_get(v, 0), Some(Offset(0x100)));
    }

    #[test]
    fn growth_preserves_vector_contents() {
        let mut arena = Arena::growable(256, crate::growth::ReallocGrowth::new()).unwrap();
        let v = arena.allocate_vector::<u32>().unwrap();
        for i in 0..300u32 {
            arena.vector_push(v, i * 3).unwrap();
        }
        assert!(arena.capacity() > 256);
        assert_eq!(arena.vector_to_vec(v), (0..300).map(|i| i * 3).collect::<Vec<_>>());
        arena.validate().unwrap();
    }
}
