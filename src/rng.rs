//! Deterministic pseudorandom source for training.
//!
//! Every random draw made while training (oversampling, feature pool
//! sampling, split generation) goes through one [`SeededRng`] created from
//! the `random_seed` option, so identical options reproduce identical models.

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a hash of the seed string; stable across platforms and releases.
fn hash_seed(seed: &str) -> u64 {
    seed.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

#[derive(Debug, Clone)]
pub struct SeededRng {
    inner: Xoshiro256PlusPlus,
}

impl SeededRng {
    pub fn from_seed_str(seed: &str) -> Self {
        Self {
            inner: Xoshiro256PlusPlus::seed_from_u64(hash_seed(seed)),
        }
    }

    /// Uniform in `[0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.inner.gen::<f64>()
    }

    /// Uniform in `[lo, hi)`; returns `lo` for an empty range.
    pub fn uniform_range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.uniform()
    }

    /// Uniform index in `0..n`. `n` must be non-zero.
    pub fn index(&mut self, n: usize) -> usize {
        self.inner.gen_range(0..n)
    }
}
