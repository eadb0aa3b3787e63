//! Benchmark workloads for the toolbelt arena allocator.
//!
//! - [`request_sizes`]: deterministic request-size mix via seed
//! - [`churn`]: allocate/free cycle over a fixed working set

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use toolbelt_arena::{AllocOptions, Arena, ArenaError, Offset};

/// `n` request sizes in `1..=max`, derived from `seed`.
///
/// The same seed always yields the same sequence.
pub fn request_sizes(n: usize, max: u32, seed: u64) -> Vec<u32> {
    let mut state = seed;
    (0..n)
        .map(|i| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add((i as u64).wrapping_mul(1442695040888963407) | 1);
            ((state >> 33) % max as u64) as u32 + 1
        })
        .collect()
}

/// Allocate every size in `sizes`, then free every other block and
/// allocate the freed sizes again. Returns the live offsets.
pub fn churn(
    arena: &mut Arena<'_>,
    sizes: &[u32],
    opts: AllocOptions,
) -> Result<Vec<Offset>, ArenaError> {
    let mut live = sizes
        .iter()
        .map(|&size| arena.allocate_with(size, opts))
        .collect::<Result<Vec<_>, _>>()?;
    for i in (0..live.len()).step_by(2) {
        arena.free(live[i])?;
        live[i] = arena.allocate_with(sizes[i], opts)?;
    }
    Ok(live)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_sizes_in_range() {
        let sizes = request_sizes(1000, 128, 42);
        assert_eq!(sizes.len(), 1000);
        assert!(sizes.iter().all(|&s| (1..=128).contains(&s)));
    }

    #[test]
    fn request_sizes_deterministic() {
        assert_eq!(request_sizes(50, 300, 7), request_sizes(50, 300, 7));
        assert_ne!(request_sizes(50, 300, 7), request_sizes(50, 300, 8));
    }

    #[test]
    fn churn_keeps_working_set() {
        let mut arena = Arena::with_capacity(64 * 1024).unwrap();
        let sizes = request_sizes(100, 200, 1);
        let live = churn(&mut arena, &sizes, AllocOptions::default()).unwrap();
        assert_eq!(live.len(), 100);
        arena.validate().unwrap();
    }
}
