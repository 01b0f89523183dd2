//! Utility routines.

use rand::{
    distributions::{Distribution, Standard},
    Rng, SeedableRng,
};
use rand_chacha::ChaCha8Rng;

/// Get a seeded rng
pub fn seeded_rng(seed: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed as u64)
}

/// Generate `n` random values for testing.
pub fn random_elements<E, R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<E>
where
    Standard: Distribution<E>,
{
    (0..n).map(|_| rng.gen()).collect()
}

/// Block range `(offset, count)` of `part` when `total` blocks are split
/// into `parts` contiguous ranges.
///
/// The first `total % parts` ranges get one extra block.
pub fn block_range(total: usize, parts: usize, part: usize) -> (usize, usize) {
    let len = total / parts;
    let rem = total % parts;
    if part < rem {
        (part * (len + 1), len + 1)
    } else {
        (rem * (len + 1) + (part - rem) * len, len)
    }
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::{block_range, random_elements, seeded_rng};

    #[test]
    fn test_block_range() {
        let ranges = (0..4).map(|part| block_range(10, 4, part)).collect_vec();
        assert_eq!(ranges, vec![(0, 3), (3, 3), (6, 2), (8, 2)]);

        let ranges = (0..5).map(|part| block_range(3, 5, part)).collect_vec();
        assert_eq!(ranges.iter().map(|r| r.1).sum::<usize>(), 3);
        assert_eq!(ranges[4], (3, 0));
    }

    #[test]
    fn test_seeded_rng_is_reproducible() {
        let a: Vec<u32> = random_elements(8, &mut seeded_rng(5));
        let b: Vec<u32> = random_elements(8, &mut seeded_rng(5));
        assert_eq!(a, b);
    }
}
