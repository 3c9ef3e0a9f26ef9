// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An implementation of MegaBlocks Oblivious RAM, with a Path ORAM baseline
//! and analytic cost counters for comparing schemes at sizes too large to simulate.
//!
//! The entry point is [`initialize`], which turns an [`OramConfig`] into an [`OramInstance`]
//! running in Real, Simulation or Counter mode.

#![warn(clippy::cargo, clippy::doc_markdown, missing_docs, rustdoc::all)]

use std::{num::TryFromIntError, ops::Add};
use thiserror::Error;

pub mod block_value;
pub mod bucket;
pub mod config;
pub mod counter;
pub mod megablocks;
pub mod mode;
pub mod path_oram;
pub mod position_map;
pub mod random_oracle;
pub mod stash;
pub mod store;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use crate::block_value::{BlockValue, Occupancy, OramPayload};
pub use crate::config::{ExecutionMode, OramConfig, Scheme};
pub use crate::counter::{CounterOram, OverflowProbabilityExceeded};
pub use crate::megablocks::MegaBlocksOram;
pub use crate::mode::{initialize, OramInstance};
pub use crate::path_oram::PathOram;
pub use crate::random_oracle::RandomOracle;
pub use crate::store::{BucketStore, BucketTouch, PathStorage, RealStore, SimulationStore};

/// The numeric type used to specify the size of an ORAM block in bytes.
pub type BlockSize = usize;
/// The numeric type used to specify the size of an ORAM in blocks, and to index into the ORAM.
pub type Address = u64;
/// The numeric type used to specify the size of an ORAM bucket in blocks.
pub type BucketSize = usize;
/// Numeric type used to represent the size of a stash in blocks.
pub type StashSize = u64;
/// Identifies a megablock, i.e. a group of logical blocks that share a leaf.
pub type MegablockId = u64;
/// A leaf label in `[0, number of leaves)`.
pub type Leaf = u64;
/// The number of physical bucket operations (reads plus writes).
pub type IoCost = u64;

/// An error raised by an ORAM instance.
///
/// `InvalidBlockId` is recoverable. `StashOverflow`, `PathIntegrityViolation`, `BucketOverflow`
/// and `BucketOutOfRange` are fatal and poison the instance that raised them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OramError {
    /// Errors arising from conversions between integer types.
    #[error("Arithmetic error encountered.")]
    IntegerConversionError(#[from] TryFromIntError),
    /// Errors arising from attempting to make an ORAM access to an invalid address.
    #[error("Block id {address} is outside [0, {capacity}).")]
    InvalidBlockId {
        /// The rejected address.
        address: Address,
        /// The number of logical blocks in the instance.
        capacity: Address,
    },
    /// Errors arising from invalid parameters or configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfigurationError(String),
    /// The stash outgrew its configured bound.
    #[error("Stash overflow: {occupancy} blocks exceed the bound of {bound}.")]
    StashOverflow {
        /// The number of blocks in the stash when the overflow was detected.
        occupancy: StashSize,
        /// The configured bound.
        bound: StashSize,
    },
    /// A block was found somewhere its position map entry does not allow.
    /// `bucket` is `None` when the block was expected in the stash but is missing.
    #[error("Block {address} mapped to leaf {leaf} found at bucket {bucket:?}.")]
    PathIntegrityViolation {
        /// The offending block.
        address: Address,
        /// The leaf the position map holds for it.
        leaf: Leaf,
        /// The bucket it was found in.
        bucket: Option<u64>,
    },
    /// A bucket would have held more real blocks than its capacity.
    #[error("Bucket {bucket} holds {occupancy} blocks but has capacity {capacity}.")]
    BucketOverflow {
        /// The bucket index.
        bucket: u64,
        /// The number of real blocks offered.
        occupancy: usize,
        /// The bucket capacity.
        capacity: BucketSize,
    },
    /// A bucket index outside of the tree was requested.
    #[error("Bucket index {bucket} is outside the tree.")]
    BucketOutOfRange {
        /// The bucket index.
        bucket: u64,
    },
    /// The instance previously hit a fatal error and refuses further accesses.
    #[error("The ORAM instance is poisoned by an earlier fatal error.")]
    Poisoned,
}

impl OramError {
    /// Whether the error signals a broken invariant, after which the instance cannot be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OramError::StashOverflow { .. }
                | OramError::PathIntegrityViolation { .. }
                | OramError::BucketOverflow { .. }
                | OramError::BucketOutOfRange { .. }
                | OramError::Poisoned
        )
    }
}

/// A logical operation on one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation<V> {
    /// Return the current value.
    Read,
    /// Replace the current value, returning the previous one.
    Write(V),
}

/// The outcome of one logical access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Access<V> {
    /// The value held by the block before the access.
    pub value: V,
    /// Buckets read plus buckets written while serving the access.
    pub io_cost: IoCost,
}

/// Running totals of physical work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoCounter {
    /// Buckets read from the server.
    pub bucket_reads: u64,
    /// Buckets written to the server.
    pub bucket_writes: u64,
    /// Stash insertions and removals.
    pub stash_touches: u64,
}

impl IoCounter {
    /// Bucket reads plus bucket writes.
    pub fn bucket_operations(&self) -> IoCost {
        self.bucket_reads + self.bucket_writes
    }

    /// The work done between `earlier` and `self`.
    pub fn since(&self, earlier: &IoCounter) -> IoCounter {
        IoCounter {
            bucket_reads: self.bucket_reads - earlier.bucket_reads,
            bucket_writes: self.bucket_writes - earlier.bucket_writes,
            stash_touches: self.stash_touches - earlier.stash_touches,
        }
    }
}

impl Add for IoCounter {
    type Output = IoCounter;

    fn add(self, other: IoCounter) -> IoCounter {
        IoCounter {
            bucket_reads: self.bucket_reads + other.bucket_reads,
            bucket_writes: self.bucket_writes + other.bucket_writes,
            stash_touches: self.stash_touches + other.stash_touches,
        }
    }
}

/// Statistics reported to the experiment driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OramStats {
    /// Buckets read since initialization.
    pub bucket_reads: u64,
    /// Buckets written since initialization.
    pub bucket_writes: u64,
    /// Stash insertions and removals since initialization.
    pub stash_touches: u64,
    /// Blocks currently in the stash.
    pub stash_size: StashSize,
    /// The largest stash size observed between accesses.
    pub stash_high_water_mark: StashSize,
    /// Logical accesses served.
    pub accesses: u64,
}

impl OramStats {
    /// Physical bucket operations per logical access.
    pub fn io_overhead(&self) -> f64 {
        if self.accesses == 0 {
            return 0.0;
        }
        (self.bucket_reads + self.bucket_writes) as f64 / self.accesses as f64
    }

    /// Bytes moved per logical access, given the size of one physical bucket in bytes.
    pub fn bandwidth_overhead(&self, bucket_bytes: u64) -> f64 {
        self.io_overhead() * bucket_bytes as f64
    }
}

/// The access-protocol interface shared by the tree engines.
pub trait AccessProtocol {
    /// What a bucket slot carries besides the block's identity.
    type Payload: OramPayload;

    /// Performs one logical access to `address`.
    fn access(
        &mut self,
        address: Address,
        operation: Operation<Self::Payload>,
    ) -> Result<Access<Self::Payload>, OramError>;

    /// The number of logical blocks.
    fn block_capacity(&self) -> Address;

    /// Running statistics.
    fn stats(&self) -> OramStats;

    /// Scans the whole tree and the stash, checking that every block appears exactly once
    /// and lies on the path of its mapped leaf or in the stash.
    fn verify_invariants(&self) -> Result<(), OramError>;

    /// The current leaf of every address, in address order.
    fn position_snapshot(&self) -> Vec<Leaf>;

    /// Reads the value stored at `address`.
    fn read(&mut self, address: Address) -> Result<Self::Payload, OramError> {
        Ok(self.access(address, Operation::Read)?.value)
    }

    /// Writes `value` at `address`, returning the previous value.
    fn write(&mut self, address: Address, value: Self::Payload) -> Result<Self::Payload, OramError> {
        Ok(self.access(address, Operation::Write(value))?.value)
    }
}
