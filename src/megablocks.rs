// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An implementation of MegaBlocks ORAM.

use crate::{
    config::OramConfig,
    path_oram::TreeOramCore,
    store::{BucketTouch, PathStorage},
    Access, AccessProtocol, Address, Leaf, MegablockId, OramError, OramStats, Operation,
};

/// A MegaBlocks ORAM over a `PathStorage` tree.
///
/// Logical blocks are grouped into megablocks of `L` members that always share a leaf,
/// so one path read brings a whole group into the stash.
///
/// ## Parameters
///
/// - Block capacity `N`: the tree has `N / L` leaves.
/// - Bucket size `Z`: each bucket holds `Z * L` blocks.
/// - Megablock size `L`: a power of two no larger than `N`. With `L = 1` the protocol is Path ORAM.
/// - Overflow size: scaled by `L` to give the number of blocks that may stay in the stash between accesses.
/// - Reshuffling: when enabled, the served block may trade groups with a block of another
///   megablock that is entirely in the stash, so group membership does not stay fixed forever.
#[derive(Debug)]
pub struct MegaBlocksOram<S: PathStorage> {
    pub(crate) core: TreeOramCore<S>,
    megablock_size: u64,
    reshuffle: bool,
}

impl<S: PathStorage> MegaBlocksOram<S> {
    /// Returns a new `MegaBlocksOram` mapping addresses `0 <= address < config.block_capacity` to default values.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `config` fails validation,
    /// and a `StashOverflow` if the initial placement leaves more blocks in the stash than it may hold.
    pub fn new(config: &OramConfig) -> Result<Self, OramError> {
        log::info!(
            "MegaBlocksOram::new(capacity = {}, Z = {}, L = {})",
            config.block_capacity,
            config.blocks_per_bucket,
            config.megablock_size
        );
        config.validate()?;

        let megablock_size = config.megablock_size;
        let core = TreeOramCore::new(
            config.block_capacity,
            megablock_size,
            config.blocks_per_bucket * usize::try_from(megablock_size)?,
            config.stash_overflow_size * megablock_size,
            config.seed,
            config.record_trace,
        )?;
        Ok(Self {
            core,
            megablock_size,
            reshuffle: config.reshuffle_megablocks,
        })
    }

    /// The number of blocks per megablock.
    pub fn megablock_size(&self) -> u64 {
        self.megablock_size
    }

    /// The ordered bucket touches since initialization, if tracing was enabled.
    pub fn trace(&self) -> Option<&[BucketTouch]> {
        self.core.trace()
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.core.store
    }

    // Picks a stashed block from another group whose members are all stashed, and trades groups with it.
    fn reshuffle_membership(
        &mut self,
        address: Address,
        megablock: MegablockId,
    ) -> Result<Option<Address>, OramError> {
        let mut candidates = Vec::new();
        for candidate in self.core.stash.addresses() {
            let (_, group) = self.core.position_map.lookup(candidate)?;
            if group == megablock {
                continue;
            }
            let members = self.core.position_map.members(group)?;
            if members.iter().all(|member| self.core.stash.contains(*member)) {
                candidates.push(candidate);
            }
        }
        if candidates.is_empty() {
            return Ok(None);
        }

        let choice = self.core.oracle.random_index(u64::try_from(candidates.len())?);
        let partner = candidates[usize::try_from(choice)?];
        log::debug!("Megablock reshuffle -- {} <-> {}", address, partner);
        self.core.position_map.swap_membership(address, partner)?;
        Ok(Some(partner))
    }

    fn access_unchecked(
        &mut self,
        address: Address,
        operation: Operation<S::Payload>,
    ) -> Result<Access<S::Payload>, OramError> {
        let before = self.core.io();

        let (leaf, megablock) = self.core.position_map.lookup(address)?;
        log::debug!(
            "MegaBlocksOram access -- address {}, megablock {}",
            address,
            megablock
        );

        self.core.fetch(leaf)?;

        // Every member shares `leaf`, so the whole group must be in the stash now.
        let mut members = self.core.position_map.members(megablock)?.to_vec();
        let value = self.core.serve(&members, address, leaf, operation)?;

        let new_leaf = self.core.oracle.random_leaf(&self.core.geometry);
        self.core.position_map.remap_megablock(megablock, new_leaf)?;
        if self.reshuffle {
            if let Some(partner) = self.reshuffle_membership(address, megablock)? {
                members.push(partner);
            }
        }
        for member in members {
            self.core.retag(member)?;
        }

        self.core.evict(leaf)?;

        let spent = self.core.io().since(&before);
        Ok(Access {
            value,
            io_cost: self.core.finish_access(spent),
        })
    }
}

impl<S: PathStorage> AccessProtocol for MegaBlocksOram<S> {
    type Payload = S::Payload;

    fn access(
        &mut self,
        address: Address,
        operation: Operation<S::Payload>,
    ) -> Result<Access<S::Payload>, OramError> {
        self.core.check_access(address)?;
        let result = self.access_unchecked(address, operation);
        self.core.note_outcome(&result);
        result
    }

    fn block_capacity(&self) -> Address {
        self.core.block_capacity()
    }

    fn stats(&self) -> OramStats {
        self.core.stats()
    }

    fn verify_invariants(&self) -> Result<(), OramError> {
        self.core.verify_invariants()?;

        let position_map = &self.core.position_map;
        for megablock in 0..position_map.number_of_megablocks() {
            let group_leaf = position_map.leaf_of_megablock(megablock)?;
            let members = position_map.members(megablock)?;
            if u64::try_from(members.len())? != self.megablock_size {
                return Err(OramError::InvalidConfigurationError(format!(
                    "megablock {megablock} has {} members instead of {}",
                    members.len(),
                    self.megablock_size
                )));
            }
            for member in members {
                let (leaf, _) = position_map.lookup(*member)?;
                if leaf != group_leaf {
                    return Err(OramError::PathIntegrityViolation {
                        address: *member,
                        leaf: group_leaf,
                        bucket: None,
                    });
                }
            }
        }
        Ok(())
    }

    fn position_snapshot(&self) -> Vec<Leaf> {
        self.core.position_map.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::SimulationStore, test_utils::*, BlockValue, RealStore};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    create_correctness_tests_for_oram_type!(MegaBlocksOram, RealStore);

    create_stash_bound_tests_for_oram_type!(MegaBlocksOram);

    #[test]
    fn cost_depends_on_number_of_groups() {
        let config = OramConfig::new(256, 0).with_megablock_size(4);
        let mut oram = MegaBlocksOram::<SimulationStore>::new(&config).unwrap();
        // 64 leaves, so 7 buckets per path.
        for address in (0..256).step_by(3) {
            assert_eq!(oram.read(address).map(|_| ()), Ok(()));
        }
        let stats = oram.stats();
        assert_eq!(stats.io_overhead(), 14.0);
        assert_eq!(oram.store().bucket_capacity(), 16);
    }

    #[test]
    fn groups_stay_together() {
        init_logger();
        let config = OramConfig::new(64, 9).with_megablock_size(8);
        let mut oram = MegaBlocksOram::<RealStore<2>>::new(&config).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..200 {
            let address = rng.gen_range(0..64);
            oram.write(address, rng.gen()).unwrap();
            oram.verify_invariants().unwrap();
        }
        let snapshot = oram.position_snapshot();
        for group in snapshot.chunks(8) {
            assert!(group.iter().all(|leaf| *leaf == group[0]));
        }
    }

    #[test]
    fn reshuffling_preserves_contents_and_group_sizes() {
        init_logger();
        let config = OramConfig::new(64, 4)
            .with_megablock_size(4)
            .with_blocks_per_bucket(2)
            .with_reshuffle_megablocks(true);
        let mut oram = MegaBlocksOram::<RealStore<4>>::new(&config).unwrap();
        let mut mirror = vec![BlockValue::<4>::default(); 64];
        let mut rng = StdRng::seed_from_u64(0);

        for _ in 0..500 {
            let address = rng.gen_range(0..64u64);
            if rng.gen::<bool>() {
                let value: BlockValue<4> = rng.gen();
                oram.write(address, value).unwrap();
                mirror[address as usize] = value;
            } else {
                assert_eq!(oram.read(address).unwrap(), mirror[address as usize]);
            }
            oram.verify_invariants().unwrap();
        }
        for address in 0..64 {
            assert_eq!(oram.read(address).unwrap(), mirror[address as usize]);
        }
    }

    #[test]
    fn end_to_end_scenario() {
        init_logger();
        let config = OramConfig::new(16, 42)
            .with_blocks_per_bucket(4)
            .with_megablock_size(2);
        let bound = config.stash_bound();
        let mut oram = MegaBlocksOram::<RealStore<1>>::new(&config).unwrap();
        let x = BlockValue::from_bytes(b"x");

        oram.write(3, x).unwrap();
        assert!(oram.stats().stash_size <= bound);

        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..30 {
            let mut address = rng.gen_range(0..16);
            if address == 3 {
                address = 4;
            }
            if rng.gen::<bool>() {
                oram.read(address).unwrap();
            } else {
                oram.write(address, rng.gen()).unwrap();
            }
            assert!(oram.stats().stash_size <= bound);
        }

        assert_eq!(oram.read(3).unwrap(), x);
        assert!(oram.stats().stash_high_water_mark <= bound);
    }

    #[test]
    fn whole_tree_megablock() {
        let config = OramConfig::new(8, 0).with_megablock_size(8);
        let mut oram = MegaBlocksOram::<RealStore<1>>::new(&config).unwrap();
        let value = BlockValue::from_bytes(b"z");
        oram.write(7, value).unwrap();
        let access = oram.access(7, Operation::Read).unwrap();
        assert_eq!(access.value, value);
        assert_eq!(access.io_cost, 2);
    }

    #[test]
    fn stash_overflow_poisons_the_instance() {
        init_logger();
        let config = OramConfig::new(256, 0)
            .with_megablock_size(2)
            .with_blocks_per_bucket(1)
            .with_stash_overflow_size(0);
        let mut oram = (0..16)
            .find_map(|seed| {
                MegaBlocksOram::<SimulationStore>::new(&OramConfig {
                    seed,
                    ..config.clone()
                })
                .ok()
            })
            .unwrap();

        let error = (0..256)
            .find_map(|address| oram.read(address).err())
            .unwrap();
        assert!(matches!(error, OramError::StashOverflow { bound: 0, .. }));

        let accesses = oram.stats().accesses;
        assert_eq!(oram.read(0), Err(OramError::Poisoned));
        assert_eq!(oram.read(255), Err(OramError::Poisoned));
        assert_eq!(oram.stats().accesses, accesses);
    }
}
