//! Seeded random sampler for point-cloud LOD selection.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Owns the random state used to shuffle spooled cells.
///
/// One sampler is created per run from a seed, so the same input and seed
/// always produce the same tiles.
#[derive(Debug, Clone)]
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform in-place Fisher–Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }
}

/// Number of leading records to keep from a shuffled cell.
pub fn sample_count(total: usize, fraction: f64) -> usize {
    if total == 0 {
        return 0;
    }
    ((total as f64 * fraction.clamp(0.0, 1.0)).ceil() as usize).clamp(1, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_order() {
        let mut a: Vec<u32> = (0..100).collect();
        let mut b = a.clone();
        Sampler::new(42).shuffle(&mut a);
        Sampler::new(42).shuffle(&mut b);
        assert_eq!(a, b);
        assert_ne!(a, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffle_is_permutation() {
        let mut items: Vec<u32> = (0..1000).collect();
        Sampler::new(7).shuffle(&mut items);
        items.sort_unstable();
        assert_eq!(items, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_sample_count() {
        assert_eq!(sample_count(0, 0.5), 0);
        assert_eq!(sample_count(10, 0.5), 5);
        assert_eq!(sample_count(10, 0.125), 2);
        assert_eq!(sample_count(3, 0.01), 1);
        assert_eq!(sample_count(10, 2.0), 10);
    }
}
