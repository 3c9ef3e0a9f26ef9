// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Block and bucket structures for tree-based ORAM.

use crate::{Address, BucketSize, Leaf, OramPayload};

#[derive(Clone, Copy, PartialEq)]
/// A block combines a payload with two metadata fields; its ORAM `address` and the `leaf` it is mapped to.
pub struct Block<P> {
    /// The logical address.
    pub address: Address,
    /// The leaf whose path the block must lie on.
    pub leaf: Leaf,
    /// The block contents.
    pub payload: P,
}

impl<P: OramPayload> Block<P> {
    const DUMMY_ADDRESS: Address = Address::MAX;

    /// A real block.
    pub fn new(address: Address, leaf: Leaf, payload: P) -> Self {
        Self {
            address,
            leaf,
            payload,
        }
    }

    /// An empty slot.
    pub fn dummy() -> Self {
        Self {
            address: Self::DUMMY_ADDRESS,
            leaf: 0,
            payload: P::default(),
        }
    }

    /// Whether this is an empty slot.
    pub fn is_dummy(&self) -> bool {
        self.address == Self::DUMMY_ADDRESS
    }
}

impl<P: OramPayload> std::fmt::Debug for Block<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_dummy() {
            write!(f, "Block::Dummy")
        } else {
            f.debug_struct("Block")
                .field("address", &self.address)
                .field("leaf", &self.leaf)
                .field("payload", &self.payload)
                .finish()
        }
    }
}

#[derive(Clone, PartialEq)]
/// A bucket of fixed capacity. Unused slots hold dummy blocks.
pub struct Bucket<P: OramPayload> {
    /// The slots of this bucket.
    pub(crate) blocks: Vec<Block<P>>,
}

impl<P: OramPayload> Bucket<P> {
    /// An empty bucket with `capacity` slots.
    pub fn new(capacity: BucketSize) -> Self {
        Self {
            blocks: vec![Block::dummy(); capacity],
        }
    }

    /// The number of slots.
    pub fn capacity(&self) -> BucketSize {
        self.blocks.len()
    }

    /// The number of real blocks.
    pub fn occupancy(&self) -> usize {
        self.blocks.iter().filter(|block| !block.is_dummy()).count()
    }

    /// Places `block` in the first empty slot, handing it back if the bucket is full.
    pub fn insert(&mut self, block: Block<P>) -> Result<(), Block<P>> {
        match self.blocks.iter_mut().find(|slot| slot.is_dummy()) {
            Some(slot) => {
                *slot = block;
                Ok(())
            }
            None => Err(block),
        }
    }

    /// The real blocks held by this bucket.
    pub fn real_blocks(&self) -> impl Iterator<Item = &Block<P>> {
        self.blocks.iter().filter(|block| !block.is_dummy())
    }

    /// Empties the bucket, returning its real blocks.
    pub fn drain_real_blocks(&mut self) -> Vec<Block<P>> {
        let mut result = Vec::new();
        for slot in self.blocks.iter_mut() {
            if !slot.is_dummy() {
                result.push(*slot);
                *slot = Block::dummy();
            }
        }
        result
    }
}

impl<P: OramPayload> std::fmt::Debug for Bucket<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.occupancy() == 0 {
            write!(f, "Bucket::Dummy")
        } else {
            f.debug_struct("Bucket")
                .field("blocks", &self.blocks)
                .finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Block, Bucket};
    use crate::{BlockValue, Occupancy};

    #[test]
    fn insert_until_full() {
        let mut bucket = Bucket::<Occupancy>::new(2);
        assert_eq!(bucket.occupancy(), 0);
        assert!(bucket.insert(Block::new(0, 0, Occupancy)).is_ok());
        assert!(bucket.insert(Block::new(1, 0, Occupancy)).is_ok());
        let rejected = bucket.insert(Block::new(2, 0, Occupancy)).unwrap_err();
        assert_eq!(rejected.address, 2);
        assert_eq!(bucket.occupancy(), 2);
    }

    #[test]
    fn drain_leaves_dummies() {
        let mut bucket = Bucket::<BlockValue<4>>::new(3);
        bucket
            .insert(Block::new(5, 1, BlockValue::from_bytes(b"v")))
            .unwrap();
        let drained = bucket.drain_real_blocks();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].address, 5);
        assert_eq!(bucket.occupancy(), 0);
        assert_eq!(bucket.capacity(), 3);
        assert!(format!("{bucket:?}").contains("Dummy"));
    }
}
