// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The client-side stash of a tree ORAM.

use crate::{
    bucket::{Block, Bucket},
    utils::{TreeGeometry, TreeHeight},
    Address, BucketSize, Leaf, OramError, OramPayload, StashSize,
};
use std::collections::HashMap;

#[derive(Debug)]
/// Blocks held by the client between accesses, keyed by address.
///
/// The stash may briefly hold a whole path's worth of blocks during an access;
/// `overflow_bound` limits what may remain after eviction.
pub struct Stash<P: OramPayload> {
    blocks: HashMap<Address, Block<P>>,
    working_capacity: StashSize,
    overflow_bound: StashSize,
    touches: u64,
    high_water_mark: StashSize,
}

impl<P: OramPayload> Stash<P> {
    /// Returns a new empty stash that can absorb one path of `path_size` slots on top of
    /// `overflow_bound` resident blocks.
    pub fn new(path_size: StashSize, overflow_bound: StashSize) -> Self {
        Self {
            blocks: HashMap::new(),
            working_capacity: path_size + overflow_bound,
            overflow_bound,
            touches: 0,
            high_water_mark: 0,
        }
    }

    /// The number of blocks in the stash.
    pub fn len(&self) -> StashSize {
        self.blocks.len() as StashSize
    }

    /// Whether the stash holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Insertions plus removals since the last reset.
    pub fn touches(&self) -> u64 {
        self.touches
    }

    /// The largest post-eviction size observed since the last reset.
    pub fn high_water_mark(&self) -> StashSize {
        self.high_water_mark
    }

    /// Zeroes the touch counter and the high-water mark.
    pub fn reset_counters(&mut self) {
        self.touches = 0;
        self.high_water_mark = self.len();
    }

    /// Adds `block` to the stash.
    ///
    /// # Errors
    ///
    /// Fails with `StashOverflow` if the stash is already at its working capacity.
    pub fn insert(&mut self, block: Block<P>) -> Result<(), OramError> {
        debug_assert!(!block.is_dummy());
        if !self.blocks.contains_key(&block.address) && self.len() >= self.working_capacity {
            return Err(OramError::StashOverflow {
                occupancy: self.len() + 1,
                bound: self.working_capacity,
            });
        }
        self.touches += 1;
        self.blocks.insert(block.address, block);
        Ok(())
    }

    /// Removes and returns the block at `address`, if present.
    pub fn remove(&mut self, address: Address) -> Option<Block<P>> {
        let result = self.blocks.remove(&address);
        if result.is_some() {
            self.touches += 1;
        }
        result
    }

    /// Whether the block at `address` is in the stash.
    pub fn contains(&self, address: Address) -> bool {
        self.blocks.contains_key(&address)
    }

    /// The block at `address`, if present.
    pub fn get(&self, address: Address) -> Option<&Block<P>> {
        self.blocks.get(&address)
    }

    /// A mutable reference to the block at `address`, if present.
    pub fn get_mut(&mut self, address: Address) -> Option<&mut Block<P>> {
        self.blocks.get_mut(&address)
    }

    /// The resident addresses, in increasing order.
    pub fn addresses(&self) -> Vec<Address> {
        let mut result: Vec<Address> = self.blocks.keys().copied().collect();
        result.sort_unstable();
        result
    }

    /// Every resident block with the deepest level it may occupy on the path to `leaf`,
    /// deepest first and then by increasing address.
    pub fn blocks_touching_path(
        &self,
        geometry: &TreeGeometry,
        leaf: Leaf,
    ) -> Vec<(TreeHeight, Address)> {
        let mut result: Vec<(TreeHeight, Address)> = self
            .blocks
            .values()
            .map(|block| (geometry.deepest_shared_level(block.leaf, leaf), block.address))
            .collect();
        result.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        result
    }

    /// Greedily repacks the path to `leaf` from the bottom up, removing the placed blocks
    /// from the stash. Returns the new buckets, root first.
    ///
    /// At each level the blocks that may go deepest are placed first, ties broken by
    /// smaller address. Blocks that do not fit stay in the stash.
    pub fn evict_to_path(
        &mut self,
        geometry: &TreeGeometry,
        leaf: Leaf,
        bucket_capacity: BucketSize,
    ) -> Result<Vec<Bucket<P>>, OramError> {
        let height = geometry.height();
        let mut pending = self.blocks_touching_path(geometry, leaf);
        let mut path = vec![Bucket::new(bucket_capacity); usize::try_from(height + 1)?];

        for level in (0..=height).rev() {
            let bucket = &mut path[usize::try_from(level)?];
            let mut placed = 0;
            let mut remaining = Vec::with_capacity(pending.len());
            for (deepest, address) in pending {
                if placed < bucket_capacity && deepest >= level {
                    if let Some(block) = self.remove(address) {
                        if bucket.insert(block).is_err() {
                            return Err(OramError::BucketOverflow {
                                bucket: geometry.node_on_path(leaf, level),
                                occupancy: placed + 1,
                                capacity: bucket_capacity,
                            });
                        }
                        placed += 1;
                    }
                } else {
                    remaining.push((deepest, address));
                }
            }
            pending = remaining;
        }

        self.high_water_mark = self.high_water_mark.max(self.len());
        Ok(path)
    }

    /// Checks the post-eviction size against the overflow bound.
    pub fn check_bound(&self) -> Result<(), OramError> {
        if self.len() > self.overflow_bound {
            return Err(OramError::StashOverflow {
                occupancy: self.len(),
                bound: self.overflow_bound,
            });
        }
        Ok(())
    }
}
