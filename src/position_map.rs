// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Position maps: the client-side table that also tracks megablock membership, and the
//! recursive Path ORAM that stores leaves on the server once the table grows too large.

use crate::{
    block_value::OramPayload, config::OramConfig, path_oram::PathOram, store::BucketStore,
    AccessProtocol, Address, IoCounter, Leaf, MegablockId, OramError, Scheme,
};
use log::debug;
use subtle::{Choice, ConditionallySelectable};

/// Maps every address to its leaf and megablock, and every megablock to its members.
///
/// Both directions are plain index tables; blocks never point back at their group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionMap {
    leaves: Vec<Leaf>,
    megablocks: Vec<MegablockId>,
    members: Vec<Vec<Address>>,
}

impl PositionMap {
    /// Returns a new position map over `block_capacity` addresses, grouped `megablock_size` at a time.
    /// Megablock `m` initially holds addresses `m * megablock_size` up to `(m + 1) * megablock_size - 1`.
    /// Every leaf starts at 0 and must be assigned before use.
    ///
    /// # Errors
    ///
    /// Fails if `megablock_size` is zero or does not divide `block_capacity`.
    pub fn new(block_capacity: Address, megablock_size: u64) -> Result<Self, OramError> {
        if megablock_size == 0 || block_capacity % megablock_size != 0 {
            return Err(OramError::InvalidConfigurationError(format!(
                "megablock size {megablock_size} must be nonzero and divide {block_capacity}"
            )));
        }
        debug!(
            "PositionMap::new -- {} addresses in groups of {}",
            block_capacity, megablock_size
        );

        let capacity = usize::try_from(block_capacity)?;
        let group_size = usize::try_from(megablock_size)?;
        let number_of_megablocks = capacity / group_size;

        let mut megablocks: Vec<MegablockId> = Vec::with_capacity(capacity);
        let mut members: Vec<Vec<Address>> = Vec::with_capacity(number_of_megablocks);
        for megablock in 0..block_capacity / megablock_size {
            let first = megablock * megablock_size;
            members.push((first..first + megablock_size).collect());
            megablocks.extend(std::iter::repeat(megablock).take(group_size));
        }

        Ok(Self {
            leaves: vec![0; capacity],
            megablocks,
            members,
        })
    }

    /// The number of addresses.
    pub fn block_capacity(&self) -> Address {
        self.leaves.len() as Address
    }

    /// The number of megablocks.
    pub fn number_of_megablocks(&self) -> u64 {
        self.members.len() as u64
    }

    fn address_slot(&self, address: Address) -> Result<usize, OramError> {
        let slot = usize::try_from(address)?;
        if slot >= self.leaves.len() {
            return Err(OramError::InvalidBlockId {
                address,
                capacity: self.block_capacity(),
            });
        }
        Ok(slot)
    }

    fn megablock_slot(&self, megablock: MegablockId) -> Result<usize, OramError> {
        let slot = usize::try_from(megablock)?;
        if slot >= self.members.len() {
            return Err(OramError::InvalidConfigurationError(format!(
                "megablock {megablock} does not exist"
            )));
        }
        Ok(slot)
    }

    /// The leaf and megablock of `address`.
    pub fn lookup(&self, address: Address) -> Result<(Leaf, MegablockId), OramError> {
        let slot = self.address_slot(address)?;
        Ok((self.leaves[slot], self.megablocks[slot]))
    }

    /// Sets the leaf and megablock of `address`. Changing the megablock moves the address
    /// between member lists.
    pub fn update(
        &mut self,
        address: Address,
        leaf: Leaf,
        megablock: MegablockId,
    ) -> Result<(), OramError> {
        let slot = self.address_slot(address)?;
        let new_group = self.megablock_slot(megablock)?;
        let old_megablock = self.megablocks[slot];
        if old_megablock != megablock {
            let old_group = self.megablock_slot(old_megablock)?;
            self.members[old_group].retain(|member| *member != address);
            let members = &mut self.members[new_group];
            let position = members.partition_point(|member| *member < address);
            members.insert(position, address);
            self.megablocks[slot] = megablock;
        }
        self.leaves[slot] = leaf;
        Ok(())
    }

    /// The members of `megablock`, in increasing address order.
    pub fn members(&self, megablock: MegablockId) -> Result<&[Address], OramError> {
        let slot = self.megablock_slot(megablock)?;
        Ok(&self.members[slot])
    }

    /// The leaf shared by the members of `megablock`.
    pub fn leaf_of_megablock(&self, megablock: MegablockId) -> Result<Leaf, OramError> {
        let slot = self.megablock_slot(megablock)?;
        match self.members[slot].first() {
            Some(first) => Ok(self.leaves[usize::try_from(*first)?]),
            None => Err(OramError::InvalidConfigurationError(format!(
                "megablock {megablock} has no members"
            ))),
        }
    }

    /// Maps every member of `megablock` to `leaf`.
    pub fn remap_megablock(&mut self, megablock: MegablockId, leaf: Leaf) -> Result<(), OramError> {
        let slot = self.megablock_slot(megablock)?;
        for member in &self.members[slot] {
            self.leaves[usize::try_from(*member)?] = leaf;
        }
        Ok(())
    }

    /// Exchanges the megablocks of `a` and `b`. Each address takes the leaf of its new group.
    pub fn swap_membership(&mut self, a: Address, b: Address) -> Result<(), OramError> {
        let (leaf_a, megablock_a) = self.lookup(a)?;
        let (leaf_b, megablock_b) = self.lookup(b)?;
        if megablock_a == megablock_b {
            return Ok(());
        }
        self.update(a, leaf_b, megablock_b)?;
        self.update(b, leaf_a, megablock_a)
    }

    /// The leaf of every address, in address order.
    pub fn snapshot(&self) -> Vec<Leaf> {
        self.leaves.clone()
    }
}

/// The number of leaves packed into one block of a position-map ORAM.
pub const POSITIONS_PER_BLOCK: usize = 8;

#[repr(align(64))]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
/// An `OramPayload` holding the leaves of `POSITIONS_PER_BLOCK` consecutive addresses.
pub struct AddressBlock {
    /// The packed leaves.
    pub data: [Leaf; POSITIONS_PER_BLOCK],
}

impl Default for AddressBlock {
    fn default() -> Self {
        Self {
            data: [0; POSITIONS_PER_BLOCK],
        }
    }
}

impl ConditionallySelectable for AddressBlock {
    fn conditional_select(a: &Self, b: &Self, choice: Choice) -> Self {
        let mut result = Self::default();
        for i in 0..POSITIONS_PER_BLOCK {
            result.data[i] = Leaf::conditional_select(&a.data[i], &b.data[i], choice);
        }
        result
    }
}

impl OramPayload for AddressBlock {}

/// The store behind every position-map ORAM, whatever the mode of the data ORAM above it.
pub type AddressStore = BucketStore<AddressBlock>;

/// Whether a Path ORAM over `block_capacity` blocks stores its position map recursively.
/// A two-block ORAM never recurses, since its position map would be no smaller.
pub fn needs_recursion(block_capacity: Address, local_capacity: Option<Address>) -> bool {
    match local_capacity {
        Some(local_capacity) => block_capacity > 2 && block_capacity >= local_capacity,
        None => false,
    }
}

/// The block capacity of the ORAM holding the position map of `block_capacity` addresses.
pub fn position_oram_capacity(block_capacity: Address) -> Address {
    block_capacity
        .div_ceil(POSITIONS_PER_BLOCK as Address)
        .next_power_of_two()
        .max(2)
}

/// The block capacities of a Path ORAM over `block_capacity` blocks and of every position-map ORAM below it.
pub fn recursion_levels(block_capacity: Address, local_capacity: Option<Address>) -> Vec<Address> {
    let mut levels = vec![block_capacity];
    let mut capacity = block_capacity;
    while needs_recursion(capacity, local_capacity) {
        capacity = position_oram_capacity(capacity);
        levels.push(capacity);
    }
    levels
}

/// A position map stored in a Path ORAM of `AddressBlock`s, which may itself recurse.
///
/// Each lookup is one access to the inner ORAM that reads the old leaf and writes the new one.
#[derive(Debug)]
pub struct RecursivePositionMap {
    oram: Box<PathOram<AddressStore>>,
    number_of_addresses: Address,
}

impl RecursivePositionMap {
    /// Stores `leaves` in a new position-map ORAM configured like `config` and seeded by `seed`.
    /// Loading the leaves is setup work and is not counted.
    pub fn new(leaves: &[Leaf], config: &OramConfig, seed: u64) -> Result<Self, OramError> {
        let number_of_addresses = Address::try_from(leaves.len())?;
        let inner_config = OramConfig {
            block_capacity: position_oram_capacity(number_of_addresses),
            megablock_size: 1,
            seed,
            scheme: Scheme::PathOram,
            record_trace: false,
            ..config.clone()
        };
        debug!(
            "RecursivePositionMap::new -- {} addresses in {} blocks",
            number_of_addresses, inner_config.block_capacity
        );

        let mut oram = Box::new(PathOram::<AddressStore>::new(&inner_config)?);
        for (block_address, chunk) in (0..).zip(leaves.chunks(POSITIONS_PER_BLOCK)) {
            oram.update_in_place(block_address, |block| {
                block.data[..chunk.len()].copy_from_slice(chunk)
            })?;
        }
        oram.reset_statistics();

        Ok(Self {
            oram,
            number_of_addresses,
        })
    }

    fn address_of_block(address: Address) -> Address {
        address >> POSITIONS_PER_BLOCK.ilog2()
    }

    fn address_within_block(address: Address) -> Result<usize, OramError> {
        Ok(usize::try_from(address)? % POSITIONS_PER_BLOCK)
    }

    /// Records `new_leaf` for `address`, returning the leaf it replaces.
    pub fn exchange(&mut self, address: Address, new_leaf: Leaf) -> Result<Leaf, OramError> {
        if address >= self.number_of_addresses {
            return Err(OramError::InvalidBlockId {
                address,
                capacity: self.number_of_addresses,
            });
        }
        let slot = Self::address_within_block(address)?;
        let previous = self
            .oram
            .update_in_place(Self::address_of_block(address), |block| {
                block.data[slot] = new_leaf
            })?;
        Ok(previous.data[slot])
    }

    /// The number of position-map ORAMs below the data ORAM, this one included.
    pub fn recursion_height(&self) -> usize {
        1 + self.oram.recursion_height()
    }

    /// Bucket and stash work done by this ORAM and every ORAM below it.
    pub fn io(&self) -> IoCounter {
        self.oram.io()
    }

    /// Zeroes the counters of this ORAM and every ORAM below it.
    pub fn reset_statistics(&mut self) {
        self.oram.reset_statistics();
    }

    /// The stored leaf of every address, read without touching the counters.
    pub fn snapshot(&self) -> Result<Vec<Leaf>, OramError> {
        let blocks = self.oram.payloads()?;
        Ok(blocks
            .iter()
            .flat_map(|block| block.data)
            .take(usize::try_from(self.number_of_addresses)?)
            .collect())
    }

    /// Checks the inner ORAM's own invariants.
    pub fn verify_invariants(&self) -> Result<(), OramError> {
        self.oram.verify_invariants()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        needs_recursion, position_oram_capacity, recursion_levels, PositionMap,
        RecursivePositionMap,
    };
    use crate::{config::OramConfig, OramError, Scheme};

    #[test]
    fn initial_groups_are_contiguous() {
        let map = PositionMap::new(8, 2).unwrap();
        assert_eq!(map.number_of_megablocks(), 4);
        assert_eq!(map.members(2).unwrap(), &[4, 5]);
        assert_eq!(map.lookup(5).unwrap(), (0, 2));
    }

    #[test]
    fn remap_moves_the_whole_group() {
        let mut map = PositionMap::new(8, 4).unwrap();
        map.remap_megablock(1, 3).unwrap();
        assert_eq!(map.leaf_of_megablock(1).unwrap(), 3);
        for address in 4..8 {
            assert_eq!(map.lookup(address).unwrap(), (3, 1));
        }
        assert_eq!(map.lookup(0).unwrap(), (0, 0));
    }

    #[test]
    fn swap_preserves_group_sizes() {
        let mut map = PositionMap::new(8, 4).unwrap();
        map.remap_megablock(0, 1).unwrap();
        map.remap_megablock(1, 2).unwrap();
        map.swap_membership(2, 6).unwrap();

        assert_eq!(map.members(0).unwrap(), &[0, 1, 3, 6]);
        assert_eq!(map.members(1).unwrap(), &[2, 4, 5, 7]);
        assert_eq!(map.lookup(2).unwrap(), (2, 1));
        assert_eq!(map.lookup(6).unwrap(), (1, 0));
    }

    #[test]
    fn out_of_range_address_is_rejected() {
        let map = PositionMap::new(4, 1).unwrap();
        assert_eq!(
            map.lookup(4),
            Err(OramError::InvalidBlockId {
                address: 4,
                capacity: 4
            })
        );
    }

    #[test]
    fn group_size_must_divide_capacity() {
        assert!(PositionMap::new(6, 4).is_err());
        assert!(PositionMap::new(4, 0).is_err());
    }

    #[test]
    fn recursion_shrinks_by_the_packing_factor() {
        assert_eq!(position_oram_capacity(1 << 10), 1 << 7);
        assert_eq!(position_oram_capacity(24), 4);
        assert_eq!(position_oram_capacity(4), 2);
        assert!(!needs_recursion(1 << 10, None));
        assert!(!needs_recursion(2, Some(1)));
        assert!(needs_recursion(16, Some(16)));
        assert!(!needs_recursion(15, Some(16)));
        assert_eq!(recursion_levels(1 << 10, Some(16)), vec![1 << 10, 1 << 7, 1 << 4, 2]);
        assert_eq!(recursion_levels(1 << 10, None), vec![1 << 10]);
    }

    #[test]
    fn recursive_map_returns_the_leaf_it_replaces() {
        let config = OramConfig::new(64, 0)
            .with_scheme(Scheme::PathOram)
            .with_position_map_local_capacity(4);
        let leaves: Vec<u64> = (0..64).map(|address| address % 7).collect();
        let mut map = RecursivePositionMap::new(&leaves, &config, 3).unwrap();
        // 64 leaves fill 8 blocks, whose own 8 leaves fill 1 block of a 2-block ORAM.
        assert_eq!(map.recursion_height(), 2);
        assert_eq!(map.io(), Default::default());
        assert_eq!(map.snapshot().unwrap(), leaves);

        assert_eq!(map.exchange(10, 5).unwrap(), 3);
        assert_eq!(map.exchange(10, 6).unwrap(), 5);
        assert_eq!(map.exchange(63, 1).unwrap(), 0);
        assert!(map.io().bucket_reads > 0);
        map.verify_invariants().unwrap();

        let mut expected = leaves;
        expected[10] = 6;
        expected[63] = 1;
        assert_eq!(map.snapshot().unwrap(), expected);
        assert!(map.exchange(64, 0).is_err());
    }
}
