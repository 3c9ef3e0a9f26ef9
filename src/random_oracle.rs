// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The seedable randomness source owned by each ORAM instance.

use crate::{utils::TreeGeometry, Leaf};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, RngCore, SeedableRng};

/// Draws leaves and permutations for one ORAM instance.
///
/// Every random decision an instance makes goes through its oracle,
/// so two instances built from the same seed and driven by the same accesses
/// touch exactly the same buckets.
#[derive(Debug, Clone)]
pub struct RandomOracle {
    rng: StdRng,
}

impl RandomOracle {
    /// An oracle whose output is fully determined by `seed`.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A uniformly random leaf of `geometry`.
    pub fn random_leaf(&mut self, geometry: &TreeGeometry) -> Leaf {
        self.rng.gen_range(0..geometry.number_of_leaves())
    }

    /// A uniformly random index in `[0, bound)`. `bound` must be nonzero.
    pub fn random_index(&mut self, bound: u64) -> u64 {
        self.rng.gen_range(0..bound)
    }

    /// Returns a random permutation of 0 through n.
    pub fn random_permutation_of_0_through_n_exclusive(&mut self, n: u64) -> Vec<u64> {
        let mut permuted_addresses = Vec::from_iter(0..n);
        permuted_addresses.shuffle(&mut self.rng);
        permuted_addresses
    }
}

impl RngCore for RandomOracle {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::RandomOracle;
    use crate::utils::TreeGeometry;

    #[test]
    fn same_seed_same_draws() {
        let geometry = TreeGeometry::with_leaves(1 << 10).unwrap();
        let mut a = RandomOracle::from_seed(7);
        let mut b = RandomOracle::from_seed(7);
        for _ in 0..100 {
            assert_eq!(a.random_leaf(&geometry), b.random_leaf(&geometry));
        }
    }

    #[test]
    fn leaves_stay_in_range() {
        let geometry = TreeGeometry::with_leaves(16).unwrap();
        let mut oracle = RandomOracle::from_seed(0);
        let mut seen = [false; 16];
        for _ in 0..1000 {
            let leaf = oracle.random_leaf(&geometry);
            assert!(leaf < 16);
            seen[leaf as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn permutation_is_a_permutation() {
        let mut oracle = RandomOracle::from_seed(0);
        let mut permutation = oracle.random_permutation_of_0_through_n_exclusive(64);
        permutation.sort_unstable();
        assert_eq!(permutation, (0..64).collect::<Vec<u64>>());
    }
}
