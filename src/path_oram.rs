// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An implementation of Path ORAM, and the tree protocol it shares with MegaBlocks.

use crate::{
    bucket::Block,
    config::OramConfig,
    position_map::{needs_recursion, PositionMap, RecursivePositionMap},
    random_oracle::RandomOracle,
    stash::Stash,
    store::{BucketTouch, PathStorage},
    utils::TreeGeometry,
    Access, AccessProtocol, Address, IoCost, IoCounter, Leaf, OramError, OramStats, Operation,
    StashSize,
};
use rand::RngCore;
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};

/// The state and steps common to every tree ORAM in this crate: a store, a stash,
/// a position map over groups of `megablock_size` blocks, and a random oracle.
///
/// Path ORAM is the special case `megablock_size = 1`.
#[derive(Debug)]
pub(crate) struct TreeOramCore<S: PathStorage> {
    /// The untrusted memory that the ORAM is obliviously accessing on behalf of its client.
    pub(crate) store: S,
    pub(crate) stash: Stash<S::Payload>,
    pub(crate) position_map: PositionMap,
    pub(crate) oracle: RandomOracle,
    pub(crate) geometry: TreeGeometry,
    poisoned: bool,
    accesses: u64,
}

impl<S: PathStorage> TreeOramCore<S> {
    /// Builds the tree and places every block, leaving setup I/O uncounted.
    ///
    /// Each megablock draws a leaf; megablocks are then visited in a random order and each member is put
    /// in the deepest bucket on its path with a free slot, or in the stash when the whole path is full.
    pub(crate) fn new(
        block_capacity: Address,
        megablock_size: u64,
        bucket_capacity: usize,
        stash_bound: StashSize,
        seed: u64,
        record_trace: bool,
    ) -> Result<Self, OramError> {
        let geometry = TreeGeometry::with_leaves(block_capacity / megablock_size)?;
        let store = S::new(geometry, bucket_capacity, record_trace)?;
        let path_size = u64::try_from(bucket_capacity)? * geometry.path_length();
        let stash = Stash::new(path_size, stash_bound);
        let position_map = PositionMap::new(block_capacity, megablock_size)?;
        let oracle = RandomOracle::from_seed(seed);

        let mut result = Self {
            store,
            stash,
            position_map,
            oracle,
            geometry,
            poisoned: false,
            accesses: 0,
        };
        result.place_initial_blocks()?;
        Ok(result)
    }

    fn place_initial_blocks(&mut self) -> Result<(), OramError> {
        let number_of_megablocks = self.position_map.number_of_megablocks();
        for megablock in 0..number_of_megablocks {
            let leaf = self.oracle.random_leaf(&self.geometry);
            self.position_map.remap_megablock(megablock, leaf)?;
        }

        let order = self
            .oracle
            .random_permutation_of_0_through_n_exclusive(number_of_megablocks);
        let capacity = self.store.bucket_capacity();
        for megablock in order {
            let leaf = self.position_map.leaf_of_megablock(megablock)?;
            let members = self.position_map.members(megablock)?.to_vec();
            for address in members {
                let block = Block::new(address, leaf, S::Payload::default());
                let free_bucket = (0..=self.geometry.height()).rev().find_map(|depth| {
                    let index = self.geometry.node_on_path(leaf, depth);
                    match self.store.peek_bucket(index) {
                        Ok(bucket) if bucket.occupancy() < capacity => Some(index),
                        _ => None,
                    }
                });
                match free_bucket {
                    Some(index) => {
                        let mut bucket = self.store.read_bucket(index)?;
                        if bucket.insert(block).is_err() {
                            return Err(OramError::BucketOverflow {
                                bucket: index,
                                occupancy: capacity + 1,
                                capacity,
                            });
                        }
                        self.store.write_bucket(index, bucket)?;
                    }
                    None => self.stash.insert(block)?,
                }
            }
        }

        self.stash.check_bound()?;
        self.store.reset_io();
        self.stash.reset_counters();
        Ok(())
    }

    pub(crate) fn block_capacity(&self) -> Address {
        self.position_map.block_capacity()
    }

    /// Rejects accesses to a poisoned instance or to an out-of-range address.
    pub(crate) fn check_access(&self, address: Address) -> Result<(), OramError> {
        if self.poisoned {
            return Err(OramError::Poisoned);
        }
        if address >= self.block_capacity() {
            return Err(OramError::InvalidBlockId {
                address,
                capacity: self.block_capacity(),
            });
        }
        Ok(())
    }

    /// Poisons the instance if `result` carries a fatal error.
    pub(crate) fn note_outcome<T>(&mut self, result: &Result<T, OramError>) {
        if let Err(error) = result {
            if error.is_fatal() && !self.poisoned {
                log::error!("ORAM instance poisoned: {}", error);
                self.poisoned = true;
            }
        }
    }

    pub(crate) fn io(&self) -> IoCounter {
        IoCounter {
            bucket_reads: self.store.read_count(),
            bucket_writes: self.store.write_count(),
            stash_touches: self.stash.touches(),
        }
    }

    /// Reads the path to `leaf` into the stash, checking each block against the position map.
    pub(crate) fn fetch(&mut self, leaf: Leaf) -> Result<(), OramError> {
        let path = self.store.read_path(leaf)?;
        for (index, mut bucket) in self.geometry.path(leaf).zip(path) {
            for block in bucket.drain_real_blocks() {
                let (mapped_leaf, _) = self.position_map.lookup(block.address)?;
                if block.leaf != mapped_leaf || !self.geometry.is_on_path(index, mapped_leaf) {
                    return Err(OramError::PathIntegrityViolation {
                        address: block.address,
                        leaf: mapped_leaf,
                        bucket: Some(index),
                    });
                }
                self.stash.insert(block)?;
            }
        }
        Ok(())
    }

    /// Reads the target's payload and, for a write, replaces it. Every member of the group is scanned
    /// the same way whichever one is the target.
    pub(crate) fn serve(
        &mut self,
        members: &[Address],
        address: Address,
        leaf: Leaf,
        operation: Operation<S::Payload>,
    ) -> Result<S::Payload, OramError> {
        let (is_write, new_value): (Choice, S::Payload) = match operation {
            Operation::Read => (0.into(), S::Payload::default()),
            Operation::Write(value) => (1.into(), value),
        };

        let mut result = S::Payload::default();
        let mut found: Choice = 0.into();
        for member in members {
            let block =
                self.stash
                    .get_mut(*member)
                    .ok_or(OramError::PathIntegrityViolation {
                        address: *member,
                        leaf,
                        bucket: None,
                    })?;
            let is_requested_address = member.ct_eq(&address);
            result.conditional_assign(&block.payload, is_requested_address);
            block
                .payload
                .conditional_assign(&new_value, is_requested_address & is_write);
            found |= is_requested_address;
        }

        if !bool::from(found) {
            return Err(OramError::PathIntegrityViolation {
                address,
                leaf,
                bucket: None,
            });
        }
        Ok(result)
    }

    /// Applies `update` to the stashed payload of `address`, returning the payload it replaces.
    pub(crate) fn update_payload(
        &mut self,
        address: Address,
        leaf: Leaf,
        update: impl FnOnce(&mut S::Payload),
    ) -> Result<S::Payload, OramError> {
        let block = self
            .stash
            .get_mut(address)
            .ok_or(OramError::PathIntegrityViolation {
                address,
                leaf,
                bucket: None,
            })?;
        let previous = block.payload;
        update(&mut block.payload);
        Ok(previous)
    }

    /// Copies the position map's leaf for `address` into its stashed block.
    pub(crate) fn retag(&mut self, address: Address) -> Result<(), OramError> {
        let (leaf, _) = self.position_map.lookup(address)?;
        match self.stash.get_mut(address) {
            Some(block) => {
                block.leaf = leaf;
                Ok(())
            }
            None => Err(OramError::PathIntegrityViolation {
                address,
                leaf,
                bucket: None,
            }),
        }
    }

    /// Writes stash blocks back along the path to `leaf` and checks the stash bound.
    pub(crate) fn evict(&mut self, leaf: Leaf) -> Result<(), OramError> {
        let path = self
            .stash
            .evict_to_path(&self.geometry, leaf, self.store.bucket_capacity())?;
        self.store.write_path(leaf, path)?;
        self.stash.check_bound()
    }

    /// Closes the books on one access that did `spent` work, returning its bucket operations.
    pub(crate) fn finish_access(&mut self, spent: IoCounter) -> IoCost {
        self.accesses += 1;
        spent.bucket_operations()
    }

    /// Zeroes the I/O counters, the stash counters and the access count.
    pub(crate) fn reset_statistics(&mut self) {
        self.store.reset_io();
        self.stash.reset_counters();
        self.accesses = 0;
    }

    pub(crate) fn stats(&self) -> OramStats {
        let io = self.io();
        OramStats {
            bucket_reads: io.bucket_reads,
            bucket_writes: io.bucket_writes,
            stash_touches: io.stash_touches,
            stash_size: self.stash.len(),
            stash_high_water_mark: self.stash.high_water_mark(),
            accesses: self.accesses,
        }
    }

    pub(crate) fn trace(&self) -> Option<&[BucketTouch]> {
        self.store.trace()
    }

    /// The payload of every address, in address order, read without touching the counters.
    pub(crate) fn payloads(&self) -> Result<Vec<S::Payload>, OramError> {
        let mut payloads = vec![S::Payload::default(); usize::try_from(self.block_capacity())?];
        let mut record = |block: &Block<S::Payload>| -> Result<(), OramError> {
            if let Some(slot) = payloads.get_mut(usize::try_from(block.address)?) {
                *slot = block.payload;
            }
            Ok(())
        };
        for index in 1..=self.geometry.number_of_buckets() {
            for block in self.store.peek_bucket(index)?.real_blocks() {
                record(block)?;
            }
        }
        for address in self.stash.addresses() {
            if let Some(block) = self.stash.get(address) {
                record(block)?;
            }
        }
        Ok(payloads)
    }

    /// Scans the whole tree and the stash.
    pub(crate) fn verify_invariants(&self) -> Result<(), OramError> {
        let mut seen = vec![false; usize::try_from(self.block_capacity())?];
        let mut mark_seen = |address: Address,
                             leaf: Leaf,
                             bucket: Option<u64>|
         -> Result<(), OramError> {
            let slot = usize::try_from(address)?;
            if slot >= seen.len() || seen[slot] {
                return Err(OramError::PathIntegrityViolation {
                    address,
                    leaf,
                    bucket,
                });
            }
            seen[slot] = true;
            Ok(())
        };

        for index in 1..=self.geometry.number_of_buckets() {
            for block in self.store.peek_bucket(index)?.real_blocks() {
                let (mapped_leaf, _) = self.position_map.lookup(block.address)?;
                if block.leaf != mapped_leaf || !self.geometry.is_on_path(index, mapped_leaf) {
                    return Err(OramError::PathIntegrityViolation {
                        address: block.address,
                        leaf: mapped_leaf,
                        bucket: Some(index),
                    });
                }
                mark_seen(block.address, mapped_leaf, Some(index))?;
            }
        }

        for address in self.stash.addresses() {
            let (mapped_leaf, _) = self.position_map.lookup(address)?;
            match self.stash.get(address) {
                Some(block) if block.leaf == mapped_leaf => {
                    mark_seen(address, mapped_leaf, None)?;
                }
                _ => {
                    return Err(OramError::PathIntegrityViolation {
                        address,
                        leaf: mapped_leaf,
                        bucket: None,
                    })
                }
            }
        }

        for (address, present) in (0..).zip(seen) {
            if !present {
                let (mapped_leaf, _) = self.position_map.lookup(address)?;
                return Err(OramError::PathIntegrityViolation {
                    address,
                    leaf: mapped_leaf,
                    bucket: None,
                });
            }
        }
        Ok(())
    }
}

/// A Path ORAM over a `PathStorage` tree.
///
/// ## Parameters
///
/// - Block capacity `N`: the tree has `N` leaves and height `log2 N`.
/// - Bucket size `Z`: the number of blocks per bucket. Typical values are 3, 4, or 5.
///     Along with the overflow size, this value affects the probability
///     of stash overflow and should be set with care.
/// - Overflow size: The number of blocks that the stash can store between ORAM accesses.
///     Exceeding it is fatal.
///
/// - Position map local capacity: at or above this many blocks the position map is kept in a
///     smaller Path ORAM of packed leaves, recursively, and each access pays for the lookups.
///
/// With Z = 4, the [original Path ORAM paper](https://eprint.iacr.org/2013/280.pdf) shows that the
/// probability of overflow does not depend on the number N of blocks stored, and bounds the chance
/// of exceeding SO blocks on one access by 14 * 0.6002^SO. The counters apply that bound per access,
/// and the default SO = 128 keeps `2N` accesses below 2^{-40} for every N up to 2^49.
#[derive(Debug)]
pub struct PathOram<S: PathStorage> {
    pub(crate) core: TreeOramCore<S>,
    position_oram: Option<RecursivePositionMap>,
}

impl<S: PathStorage> PathOram<S> {
    /// Returns a new `PathOram` mapping addresses `0 <= address < config.block_capacity` to default values.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `config` fails validation,
    /// and a `StashOverflow` if the initial placement leaves more blocks in the stash than it may hold.
    pub fn new(config: &OramConfig) -> Result<Self, OramError> {
        log::info!(
            "PathOram::new(capacity = {}, Z = {})",
            config.block_capacity,
            config.blocks_per_bucket
        );
        config.validate()?;

        let mut core = TreeOramCore::new(
            config.block_capacity,
            1,
            config.blocks_per_bucket,
            config.stash_overflow_size,
            config.seed,
            config.record_trace,
        )?;
        let position_oram =
            if needs_recursion(config.block_capacity, config.position_map_local_capacity) {
                let seed = core.oracle.next_u64();
                Some(RecursivePositionMap::new(
                    &core.position_map.snapshot(),
                    config,
                    seed,
                )?)
            } else {
                None
            };
        Ok(Self {
            core,
            position_oram,
        })
    }

    /// The number of position-map ORAMs below this one.
    pub fn recursion_height(&self) -> usize {
        self.position_oram
            .as_ref()
            .map_or(0, RecursivePositionMap::recursion_height)
    }

    /// Bucket and stash work of this ORAM and of its position-map ORAMs.
    pub fn io(&self) -> IoCounter {
        match &self.position_oram {
            Some(position_oram) => self.core.io() + position_oram.io(),
            None => self.core.io(),
        }
    }

    pub(crate) fn reset_statistics(&mut self) {
        self.core.reset_statistics();
        if let Some(position_oram) = &mut self.position_oram {
            position_oram.reset_statistics();
        }
    }

    pub(crate) fn payloads(&self) -> Result<Vec<S::Payload>, OramError> {
        self.core.payloads()
    }

    /// Applies `update` to the payload of `address` in one access, returning the payload it replaces.
    pub(crate) fn update_in_place(
        &mut self,
        address: Address,
        update: impl FnOnce(&mut S::Payload),
    ) -> Result<S::Payload, OramError> {
        self.core.check_access(address)?;
        let result = self.access_with(address, |core, leaf| {
            core.update_payload(address, leaf, update)
        });
        self.core.note_outcome(&result);
        Ok(result?.value)
    }

    /// The ordered bucket touches since initialization, if tracing was enabled.
    pub fn trace(&self) -> Option<&[BucketTouch]> {
        self.core.trace()
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.core.store
    }

    // Runs one access to `address`, with `serve` producing the returned payload once the path is in the stash.
    fn access_with<F>(&mut self, address: Address, serve: F) -> Result<Access<S::Payload>, OramError>
    where
        F: FnOnce(&mut TreeOramCore<S>, Leaf) -> Result<S::Payload, OramError>,
    {
        let before = self.io();

        let (mapped_leaf, megablock) = self.core.position_map.lookup(address)?;
        log::debug!("PathOram access -- address {}", address);

        let new_leaf = self.core.oracle.random_leaf(&self.core.geometry);
        let leaf = match &mut self.position_oram {
            Some(position_oram) => position_oram.exchange(address, new_leaf)?,
            None => mapped_leaf,
        };
        if leaf != mapped_leaf {
            return Err(OramError::PathIntegrityViolation {
                address,
                leaf: mapped_leaf,
                bucket: None,
            });
        }

        self.core.fetch(leaf)?;
        let value = serve(&mut self.core, leaf)?;

        self.core
            .position_map
            .update(address, new_leaf, megablock)?;
        self.core.retag(address)?;

        self.core.evict(leaf)?;

        let spent = self.io().since(&before);
        Ok(Access {
            value,
            io_cost: self.core.finish_access(spent),
        })
    }
}

impl<S: PathStorage> AccessProtocol for PathOram<S> {
    type Payload = S::Payload;

    fn access(
        &mut self,
        address: Address,
        operation: Operation<S::Payload>,
    ) -> Result<Access<S::Payload>, OramError> {
        self.core.check_access(address)?;
        let result = self.access_with(address, |core, leaf| {
            core.serve(&[address], address, leaf, operation)
        });
        self.core.note_outcome(&result);
        result
    }

    fn block_capacity(&self) -> Address {
        self.core.block_capacity()
    }

    fn stats(&self) -> OramStats {
        let io = self.io();
        OramStats {
            bucket_reads: io.bucket_reads,
            bucket_writes: io.bucket_writes,
            stash_touches: io.stash_touches,
            ..self.core.stats()
        }
    }

    fn verify_invariants(&self) -> Result<(), OramError> {
        self.core.verify_invariants()?;

        if let Some(position_oram) = &self.position_oram {
            position_oram.verify_invariants()?;
            let stored = position_oram.snapshot()?;
            let mapped = self.core.position_map.snapshot();
            for (address, (stored_leaf, mapped_leaf)) in (0..).zip(stored.iter().zip(&mapped)) {
                if stored_leaf != mapped_leaf {
                    return Err(OramError::PathIntegrityViolation {
                        address,
                        leaf: *mapped_leaf,
                        bucket: None,
                    });
                }
            }
            if stored.len() != mapped.len() {
                return Err(OramError::InvalidConfigurationError(format!(
                    "position map ORAM holds {} leaves for {} addresses",
                    stored.len(),
                    mapped.len()
                )));
            }
        }
        Ok(())
    }

    fn position_snapshot(&self) -> Vec<Leaf> {
        self.core.position_map.snapshot()
    }
}
