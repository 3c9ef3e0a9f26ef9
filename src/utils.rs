// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Utilities for addressing a complete binary tree of buckets.

use crate::{Leaf, OramError};

/// A bucket index in heap order: the root is 1 and the children of `i` are `2i` and `2i + 1`.
pub type TreeIndex = u64;
/// The height of a tree, or the depth of a node in it.
pub type TreeHeight = u64;

/// The largest supported tree height.
pub const MAXIMUM_TREE_HEIGHT: TreeHeight = 62;

pub(crate) trait CompleteBinaryTreeIndex
where
    Self: Sized,
{
    fn node_on_path(&self, depth: TreeHeight, height: TreeHeight) -> Self;
    fn depth(&self) -> TreeHeight;
    fn is_leaf(&self, height: TreeHeight) -> bool;
    fn common_ancestor_of_two_leaves(&self, other: Self) -> Self;
}

impl CompleteBinaryTreeIndex for TreeIndex {
    // A TreeIndex can have any nonzero value.
    fn node_on_path(&self, depth: TreeHeight, height: TreeHeight) -> Self {
        // We maintain the invariant that all TreeIndex values are nonzero.
        debug_assert_ne!(*self, 0);
        // We only call this method when the receiver is a leaf.
        debug_assert!(self.is_leaf(height));

        let shift = height - depth;
        self >> shift
    }

    fn depth(&self) -> TreeHeight {
        debug_assert_ne!(*self, 0);

        let leading_zeroes: u64 = self.leading_zeros().into();
        let index_bitlength = 64;
        index_bitlength - leading_zeroes - 1
    }

    fn is_leaf(&self, height: TreeHeight) -> bool {
        debug_assert_ne!(*self, 0);

        self.depth() == height
    }

    // Both receiver and argument must be leaves of the same tree.
    fn common_ancestor_of_two_leaves(&self, other: Self) -> Self {
        let shared_prefix_length = (self ^ other).leading_zeros();
        let common_ancestor = self >> (64 - shared_prefix_length);
        // Leaves at the same depth always share at least the root bit.
        debug_assert_ne!(common_ancestor, 0);
        common_ancestor
    }
}

/// The shape of a bucket tree with a power-of-two number of leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeGeometry {
    height: TreeHeight,
}

impl TreeGeometry {
    /// A tree with `number_of_leaves` leaves, which must be a power of two.
    pub fn with_leaves(number_of_leaves: u64) -> Result<Self, OramError> {
        if !number_of_leaves.is_power_of_two() {
            return Err(OramError::InvalidConfigurationError(format!(
                "the number of leaves ({number_of_leaves}) must be a power of two"
            )));
        }
        let height: TreeHeight = number_of_leaves.ilog2().into();
        if height > MAXIMUM_TREE_HEIGHT {
            return Err(OramError::InvalidConfigurationError(format!(
                "tree height {height} exceeds {MAXIMUM_TREE_HEIGHT}"
            )));
        }
        Ok(Self { height })
    }

    /// The depth of the leaves; the root has depth 0.
    pub fn height(&self) -> TreeHeight {
        self.height
    }

    /// The number of leaves.
    pub fn number_of_leaves(&self) -> u64 {
        1 << self.height
    }

    /// The number of buckets in the tree.
    pub fn number_of_buckets(&self) -> u64 {
        2 * self.number_of_leaves() - 1
    }

    /// The number of buckets on one root-to-leaf path.
    pub fn path_length(&self) -> u64 {
        self.height + 1
    }

    /// The heap index of `leaf`.
    pub fn leaf_index(&self, leaf: Leaf) -> TreeIndex {
        debug_assert!(leaf < self.number_of_leaves());
        self.number_of_leaves() + leaf
    }

    /// The bucket at `depth` on the path from the root to `leaf`.
    pub fn node_on_path(&self, leaf: Leaf, depth: TreeHeight) -> TreeIndex {
        self.leaf_index(leaf).node_on_path(depth, self.height)
    }

    /// The buckets on the path to `leaf`, root first.
    pub fn path(&self, leaf: Leaf) -> impl Iterator<Item = TreeIndex> + '_ {
        (0..=self.height).map(move |depth| self.node_on_path(leaf, depth))
    }

    /// The depth of the deepest bucket shared by the paths to `a` and `b`.
    pub fn deepest_shared_level(&self, a: Leaf, b: Leaf) -> TreeHeight {
        self.leaf_index(a)
            .common_ancestor_of_two_leaves(self.leaf_index(b))
            .depth()
    }

    /// Whether `bucket` lies on the path from the root to `leaf`.
    pub fn is_on_path(&self, bucket: TreeIndex, leaf: Leaf) -> bool {
        if bucket == 0 || bucket >= 2 * self.number_of_leaves() {
            return false;
        }
        let depth = bucket.depth();
        self.node_on_path(leaf, depth) == bucket
    }

    /// Whether `bucket` is a valid index into the tree.
    pub fn contains(&self, bucket: TreeIndex) -> bool {
        bucket != 0 && bucket < 2 * self.number_of_leaves()
    }
}
