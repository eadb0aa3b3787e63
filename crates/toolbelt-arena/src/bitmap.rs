//! Bitmap small-block allocator.
//!
//! Requests of up to 128 bytes are served from fixed-size slots grouped in
//! *runs*. A run is an ordinary free-list block laid out as
//!
//! ```text
//! +0  bits: u32   bit i set = slot i in use
//! +4  size: u8    slot size
//! +5  num:  u8    slots in the run
//! +6  free: u8    clear bits remaining
//! +7  pad
//! +8  num x (4-byte prefix + size bytes)
//! ```
//!
//! Each class keeps its runs in a registry vector whose header offset lives
//! in the arena header. A slot's prefix records the run's registry index and
//! the bit number, so freeing never searches.

use tracing::debug;

use crate::arena::Arena;
use crate::block::{BlockTag, MAX_RUN_INDEX, PREFIX_SIZE};
use crate::error::ArenaError;
use crate::freelist::AllocOptions;
use crate::offset::Offset;
use crate::vector::VectorHandle;

/// Number of small-block size classes.
pub const NUM_SIZE_CLASSES: usize = 4;

/// Bytes before the first slot of a run.
pub const RUN_HEADER_SIZE: u32 = 8;

const REGISTRY_RESERVE: u32 = 8;

/// A small-block size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SizeClass {
    /// 16-byte slots, 20 per run.
    Slot16,
    /// 32-byte slots, 10 per run.
    Slot32,
    /// 64-byte slots, 6 per run.
    Slot64,
    /// 128-byte slots, 2 per run.
    Slot128,
}

impl SizeClass {
    /// Every class, smallest first.
    pub const ALL: [SizeClass; NUM_SIZE_CLASSES] = [
        SizeClass::Slot16,
        SizeClass::Slot32,
        SizeClass::Slot64,
        SizeClass::Slot128,
    ];

    /// The smallest class whose slots hold `size` bytes, or `None` for 0 and
    /// anything above 128.
    pub fn for_size(size: u32) -> Option<Self> {
        match size {
            1..=16 => Some(SizeClass::Slot16),
            17..=32 => Some(SizeClass::Slot32),
            33..=64 => Some(SizeClass::Slot64),
            65..=128 => Some(SizeClass::Slot128),
            _ => None,
        }
    }

    /// Position in [`SizeClass::ALL`] and in the header's registry array.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Slot payload size in bytes.
    pub fn slot_size(self) -> u32 {
        16 << self.index()
    }

    /// Slots per run.
    pub fn slots_per_run(self) -> u32 {
        match self {
            SizeClass::Slot16 => 20,
            SizeClass::Slot32 => 10,
            SizeClass::Slot64 => 6,
            SizeClass::Slot128 => 2,
        }
    }

    /// Full byte size of one run of this class.
    pub fn run_size(self) -> u32 {
        RUN_HEADER_SIZE + (self.slot_size() + PREFIX_SIZE) * self.slots_per_run()
    }
}

/// Occupancy snapshot of one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunStats {
    /// Offset of the run header.
    pub offset: Offset,
    /// Occupancy bitmap.
    pub bits: u32,
    /// Slot size recorded in the run.
    pub slot_size: u8,
    /// Slot count recorded in the run.
    pub slots: u8,
    /// Free counter recorded in the run.
    pub free: u8,
}

impl RunStats {
    /// Offset of the payload of slot `bit`.
    pub fn slot(&self, bit: u32) -> Offset {
        Offset(
            self.offset.0
                + RUN_HEADER_SIZE
                + bit * (self.slot_size as u32 + PREFIX_SIZE)
                + PREFIX_SIZE,
        )
    }
}

impl Arena<'_> {
    /// The run registry of `class`, if one has been created.
    pub fn run_registry(&self, class: SizeClass) -> Option<VectorHandle<Offset>> {
        let slot = self.registry_slot(class);
        (!slot.is_null()).then(|| VectorHandle::new(slot))
    }

    /// Snapshot every run of `class`, oldest first.
    pub fn runs(&self, class: SizeClass) -> Result<Vec<RunStats>, ArenaError> {
        let Some(registry) = self.run_registry(class) else {
            return Ok(Vec::new());
        };
        (0..self.vector_len(registry))
            .map(|i| self.run_at(registry, i))
            .collect()
    }

    /// Eagerly create the registry and a first run for the class serving
    /// `size`. Sizes above the largest class are a no-op, as is priming a
    /// class that already has a registry.
    pub fn prime_small_blocks(&mut self, size: u32) -> Result<(), ArenaError> {
        let Some(class) = SizeClass::for_size(size) else {
            return Ok(());
        };
        if self.run_registry(class).is_some() {
            return Ok(());
        }
        let registry = self.create_registry(class)?;
        self.push_run(class, registry)
    }

    pub(crate) fn allocate_small(
        &mut self,
        class: SizeClass,
        size: u32,
        clear: bool,
    ) -> Result<Offset, ArenaError> {
        let registry = match self.run_registry(class) {
            Some(registry) => registry,
            None => self.create_registry(class)?,
        };
        loop {
            for i in (0..self.vector_len(registry)).rev() {
                let run = self.run_at(registry, i)?;
                if run.free == 0 {
                    continue;
                }
                let bit = (!run.bits).trailing_zeros();
                if bit >= run.slots as u32 {
                    return Err(ArenaError::corrupted(
                        run.offset.0,
                        format!("free count {} but every slot is taken", run.free),
                    ));
                }
                self.store_u32(run.offset.0, run.bits | (1 << bit));
                self.store_u8(run.offset.0 + 6, run.free - 1);

                let slot = run.slot(bit);
                let tag = BlockTag::Small {
                    class,
                    run: i,
                    bit: bit as u8,
                    size: size as u8,
                };
                self.store_u32(slot.0 - PREFIX_SIZE, tag.encode());
                if clear {
                    self.zero(slot.0, class.slot_size());
                }
                return Ok(slot);
            }
            self.push_run(class, registry)?;
        }
    }

    pub(crate) fn free_small(
        &mut self,
        offset: Offset,
        class: SizeClass,
        run: u32,
        bit: u8,
    ) -> Result<(), ArenaError> {
        let registry = self.run_registry(class).ok_or_else(|| {
            ArenaError::corrupted(offset.0, format!("no run registry for {class:?}"))
        })?;
        if run >= self.vector_len(registry) {
            return Err(ArenaError::corrupted(
                offset.0,
                format!("run index {run} out of range"),
            ));
        }
        let stats = self.run_at(registry, run)?;
        if bit >= stats.slots || stats.slot(bit as u32) != offset {
            return Err(ArenaError::corrupted(
                offset.0,
                format!("slot prefix names bit {bit} of run at {}", stats.offset),
            ));
        }
        let mask = 1u32 << bit;
        if stats.bits & mask == 0 {
            return Err(ArenaError::DoubleFree { offset });
        }
        self.store_u32(stats.offset.0, stats.bits & !mask);
        self.store_u8(stats.offset.0 + 6, stats.free + 1);
        Ok(())
    }

    fn run_at(&self, registry: VectorHandle<Offset>, index: u32) -> Result<RunStats, ArenaError> {
        let offset = self.vector_get(registry, index).ok_or_else(|| {
            ArenaError::corrupted(registry.header().0, format!("missing run {index}"))
        })?;
        if self.bytes(offset, RUN_HEADER_SIZE).is_none() {
            return Err(ArenaError::InvalidOffset { offset });
        }
        Ok(RunStats {
            offset,
            bits: self.load_u32(offset.0),
            slot_size: self.load_u8(offset.0 + 4),
            slots: self.load_u8(offset.0 + 5),
            free: self.load_u8(offset.0 + 6),
        })
    }

    /// Allocate the registry header and reserve room for its first runs.
    /// Both come from the free list so that this never recurses.
    fn create_registry(&mut self, class: SizeClass) -> Result<VectorHandle<Offset>, ArenaError> {
        let header = self.allocate_with(
            VectorHandle::<Offset>::HEADER_SIZE,
            AllocOptions::plain().aligned(4),
        )?;
        let registry = VectorHandle::new(header);
        self.vector_reserve_with(registry, REGISTRY_RESERVE, AllocOptions::plain())?;
        self.set_registry_slot(class, header);
        Ok(registry)
    }

    fn push_run(
        &mut self,
        class: SizeClass,
        registry: VectorHandle<Offset>,
    ) -> Result<(), ArenaError> {
        let index = self.vector_len(registry);
        if index > MAX_RUN_INDEX {
            return Err(self.out_of_memory(class.run_size() as u64));
        }
        let run = self.allocate_with(class.run_size(), AllocOptions::plain().aligned(4))?;
        self.store_u32(run.0, 0);
        self.store_u8(run.0 + 4, class.slot_size() as u8);
        self.store_u8(run.0 + 5, class.slots_per_run() as u8);
        self.store_u8(run.0 + 6, class.slots_per_run() as u8);
        self.store_u8(run.0 + 7, 0);
        self.vector_push_with(registry, run, AllocOptions::plain())?;
        debug!(?class, index, %run, "new small-block run");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_cover_one_to_128() {
        assert_eq!(SizeClass::for_size(0), None);
        assert_eq!(SizeClass::for_size(1), Some(SizeClass::Slot16));
        assert_eq!(SizeClass::for_size(16), Some(SizeClass::Slot16));
        assert_eq!(SizeClass::for_size(17), Some(SizeClass::Slot32));
        assert_eq!(SizeClass::for_size(64), Some(SizeClass::Slot64));
        assert_eq!(SizeClass::for_size(128), Some(SizeClass::Slot128));
        assert_eq!(SizeClass::for_size(129), None);
    }

    #[test]
    fn class_geometry() {
        let sizes: Vec<_> = SizeClass::ALL.iter().map(|c| c.slot_size()).collect();
        assert_eq!(sizes, vec![16, 32, 64, 128]);
        let slots: Vec<_> = SizeClass::ALL.iter().map(|c| c.slots_per_run()).collect();
        assert_eq!(slots, vec![20, 10, 6, 2]);
        assert_eq!(SizeClass::Slot16.run_size(), 8 + 20 * 20);
        for (i, class) in SizeClass::ALL.iter().enumerate() {
            assert_eq!(class.index(), i);
        }
    }

    #[test]
    fn small_request_gets_small_tag() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        let a = arena.allocate(10).unwrap();
        match arena.block_tag(a).unwrap() {
            BlockTag::Small {
                class,
                run,
                bit,
                size,
            } => {
                assert_eq!(class, SizeClass::Slot16);
                assert_eq!(run, 0);
                assert_eq!(bit, 0);
                assert_eq!(size, 10);
            }
            other => panic!("expected small tag, got {other:?}"),
        }
        assert_eq!(arena.block(a).unwrap().len(), 10);
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        let a = arena.allocate(24).unwrap();
        let b = arena.allocate(24).unwrap();
        assert_ne!(a, b);
        arena.free(a).unwrap();
        assert_eq!(arena.allocate(30).unwrap(), a);
        let runs = arena.runs(SizeClass::Slot32).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].bits, 0b11);
        assert_eq!(runs[0].free, 8);
    }

    #[test]
    fn full_run_triggers_new_run() {
        let mut arena = Arena::with_capacity(8192).unwrap();
        let slots: Vec<_> = (0..3).map(|_| arena.allocate(100).unwrap()).collect();
        let runs = arena.runs(SizeClass::Slot128).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].free, 0);
        assert_eq!(runs[1].free, 1);
        assert_eq!(
            arena.block_tag(slots[2]).unwrap(),
            BlockTag::Small {
                class: SizeClass::Slot128,
                run: 1,
                bit: 0,
                size: 100,
            }
        );
        arena.validate().unwrap();
    }

    #[test]
    fn newest_run_is_scanned_first() {
        let mut arena = Arena::with_capacity(8192).unwrap();
        let first = arena.allocate(128).unwrap();
        arena.allocate(128).unwrap();
        arena.allocate(128).unwrap();
        arena.free(first).unwrap();
        // Run 1 still has a free slot, so it wins over the hole in run 0.
        let next = arena.allocate(128).unwrap();
        assert!(matches!(
            arena.block_tag(next).unwrap(),
            BlockTag::Small { run: 1, .. }
        ));
    }

    #[test]
    fn small_double_free_is_detected() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        let a = arena.allocate(8).unwrap();
        arena.free(a).unwrap();
        assert_eq!(arena.free(a), Err(ArenaError::DoubleFree { offset: a }));
        let runs = arena.runs(SizeClass::Slot16).unwrap();
        assert_eq!(runs[0].free, 20);
    }

    #[test]
    fn small_blocks_can_be_bypassed() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        let a = arena.allocate_with(10, AllocOptions::plain()).unwrap();
        assert_eq!(arena.block_tag(a).unwrap(), BlockTag::Plain { len: 16 });
        assert!(arena.run_registry(SizeClass::Slot16).is_none());
    }

    #[test]
    fn prime_is_idempotent() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        arena.prime_small_blocks(40).unwrap();
        let hwm = arena.size();
        arena.prime_small_blocks(50).unwrap();
        assert_eq!(arena.size(), hwm);
        assert_eq!(arena.runs(SizeClass::Slot64).unwrap().len(), 1);
        arena.prime_small_blocks(4000).unwrap();
        assert_eq!(arena.size(), hwm);
    }

    #[test]
    fn small_realloc_within_class_stays_in_place() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        let a = arena.allocate(20).unwrap();
        arena.block_mut(a).unwrap().fill(1);
        let b = arena.realloc(a, 30).unwrap();
        assert_eq!(a, b);
        let data = arena.block(b).unwrap();
        assert_eq!(data.len(), 30);
        assert!(data[..20].iter().all(|&x| x == 1));
        assert!(data[20..].iter().all(|&x| x == 0));
    }

    #[test]
    fn small_realloc_across_classes_moves() {
        let mut arena = Arena::with_capacity(4096).unwrap();
        let a = arena.allocate(12).unwrap();
        arena.block_mut(a).unwrap().fill(5);
        let b = arena.realloc(a, 200).unwrap();
        assert_ne!(a, b);
        let data = arena.block(b).unwrap();
        assert!(data[..12].iter().all(|&x| x == 5));
        assert!(data[12..].iter().all(|&x| x == 0));
        assert_eq!(arena.runs(SizeClass::Slot16).unwrap()[0].free, 20);
        arena.validate().unwrap();
    }
}
