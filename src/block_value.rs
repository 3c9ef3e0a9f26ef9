// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Payloads carried by bucket slots: opaque bytes in Real mode, bare occupancy in Simulation mode.

use crate::BlockSize;
use rand::{
    distributions::{Distribution, Standard},
    Rng,
};
use std::fmt::Debug;
use subtle::{Choice, ConditionallySelectable};

/// What a block carries besides its identity.
pub trait OramPayload: Copy + Clone + Default + Debug + PartialEq + ConditionallySelectable {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(align(64))]
/// An `OramPayload` consisting of `B` unstructured bytes.
pub struct BlockValue<const B: BlockSize>([u8; B]);

impl<const B: BlockSize> BlockValue<B> {
    /// Instantiates a `BlockValue` from an array of `B` bytes.
    pub fn new(data: [u8; B]) -> Self {
        Self(data)
    }

    /// Copies `bytes` into the front of a zeroed value, truncating anything beyond `B` bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut result = Self::default();
        let length = bytes.len().min(B);
        result.0[..length].copy_from_slice(&bytes[..length]);
        result
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; B] {
        &self.0
    }
}

impl<const B: BlockSize> Default for BlockValue<B> {
    fn default() -> Self {
        BlockValue::<B>([0u8; B])
    }
}

impl<const B: BlockSize> OramPayload for BlockValue<B> {}

impl<const B: BlockSize> ConditionallySelectable for BlockValue<B> {
    fn conditional_select(a: &Self, b: &Self, choice: Choice) -> Self {
        let mut result = BlockValue::default();
        for i in 0..B {
            result.0[i] = u8::conditional_select(&a.0[i], &b.0[i], choice);
        }
        result
    }
}

impl<const B: BlockSize> Distribution<BlockValue<B>> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> BlockValue<B> {
        let mut result = BlockValue::default();
        for i in 0..B {
            result.0[i] = rng.gen();
        }
        result
    }
}

/// The Simulation-mode payload: a slot records which block it holds, and nothing else.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Occupancy;

impl OramPayload for Occupancy {}

impl ConditionallySelectable for Occupancy {
    fn conditional_select(_: &Self, _: &Self, _: Choice) -> Self {
        Occupancy
    }
}
