//! Miscellaneous utilities shared across the crate.
//!
//! The main piece is a small wrapper around `rand` used by the samplers to
//! draw index sets without replacement.

use rand::distributions::uniform::SampleUniform;
use rand::distributions::Uniform;
use rand::prelude::*;

/// Uniform integer random-number generator with a resettable range.
///
/// By default this uses a randomly seeded RNG, but callers can construct it
/// from a fixed seed for reproducible behavior.
pub struct UniformRandomGenerator<T>
where
    T: Copy + SampleUniform + PartialOrd,
{
    rng: StdRng,
    dist: Option<Uniform<T>>,
}

impl<T> Default for UniformRandomGenerator<T>
where
    T: Copy + SampleUniform + PartialOrd,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> UniformRandomGenerator<T>
where
    T: Copy + SampleUniform + PartialOrd,
{
    /// Construct with an entropy-seeded RNG.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            dist: None,
        }
    }

    /// Construct with a fixed seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            dist: None,
        }
    }

    /// Seeded when `seed` is given, entropy-seeded otherwise.
    pub fn from_optional_seed(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::new, Self::from_seed)
    }

    /// Reset the distribution range to `[min, max]`.
    pub fn reset(&mut self, min: T, max: T) {
        self.dist = Some(Uniform::new_inclusive(min, max));
    }

    /// Fill `out` with unique values drawn from `[min, max]`.
    ///
    /// The caller guarantees that the range holds at least `out.len()` values.
    pub fn gen_unique(&mut self, out: &mut [T], min: T, max: T)
    where
        T: Eq,
    {
        self.reset(min, max);
        self.gen_unique_current(out);
    }

    /// Fill `out` with unique values drawn from the current range.
    pub fn gen_unique_current(&mut self, out: &mut [T])
    where
        T: Eq,
    {
        let Some(dist) = &self.dist else {
            return;
        };
        for i in 0..out.len() {
            loop {
                let candidate = self.rng.sample(dist);
                if out[..i].iter().all(|&v| v != candidate) {
                    out[i] = candidate;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::UniformRandomGenerator;

    #[test]
    fn unique_samples_within_bounds() {
        let mut rng = UniformRandomGenerator::<usize>::from_seed(1234);
        let mut buf = [0usize; 7];
        rng.gen_unique(&mut buf, 0, 10);

        assert!(buf.iter().all(|&v| v <= 10));
        for i in 0..buf.len() {
            for j in (i + 1)..buf.len() {
                assert_ne!(buf[i], buf[j]);
            }
        }
    }

    #[test]
    fn full_range_draw_is_a_permutation() {
        let mut rng = UniformRandomGenerator::<usize>::from_seed(7);
        let mut buf = [0usize; 10];
        rng.gen_unique(&mut buf, 0, 9);
        let mut sorted = buf;
        sorted.sort_unstable();
        assert_eq!(sorted, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn deterministic_with_same_seed() {
        let mut rng1 = UniformRandomGenerator::<u32>::from_seed(42);
        let mut rng2 = UniformRandomGenerator::<u32>::from_seed(42);
        let (mut a1, mut a2) = ([0u32; 10], [0u32; 10]);

        rng1.gen_unique(&mut a1, 0, 100);
        rng2.gen_unique(&mut a2, 0, 100);

        assert_eq!(a1, a2);
    }

    #[test]
    fn draw_without_range_leaves_output_untouched() {
        let mut rng = UniformRandomGenerator::<u32>::from_seed(1);
        let mut out = [7u32; 3];
        rng.gen_unique_current(&mut out);
        assert_eq!(out, [7, 7, 7]);
    }
}
