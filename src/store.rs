// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The untrusted server: a tree of buckets that counts every bucket it hands out or takes back.

use crate::{
    bucket::Bucket,
    utils::{TreeGeometry, TreeIndex},
    BlockSize, BlockValue, BucketSize, Leaf, Occupancy, OramError, OramPayload,
};

/// Real-mode storage: slots carry payload bytes.
pub type RealStore<const B: BlockSize> = BucketStore<BlockValue<B>>;
/// Simulation-mode storage: slots carry block identities only.
pub type SimulationStore = BucketStore<Occupancy>;

/// The kind of physical operation recorded in a trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BucketTouch {
    /// A bucket was read.
    Read(TreeIndex),
    /// A bucket was written.
    Write(TreeIndex),
}

/// The read/write-path contract that every access protocol is written against.
pub trait PathStorage
where
    Self: Sized,
{
    /// What each slot carries besides the block identity.
    type Payload: OramPayload;

    /// Returns a new store of empty buckets shaped like `geometry`.
    fn new(
        geometry: TreeGeometry,
        bucket_capacity: BucketSize,
        record_trace: bool,
    ) -> Result<Self, OramError>;
    /// The shape of the tree.
    fn geometry(&self) -> TreeGeometry;
    /// The number of slots per bucket.
    fn bucket_capacity(&self) -> BucketSize;
    /// Reads the bucket at `index`, counting one read.
    fn read_bucket(&mut self, index: TreeIndex) -> Result<Bucket<Self::Payload>, OramError>;
    /// Writes the bucket at `index`, counting one write.
    fn write_bucket(
        &mut self,
        index: TreeIndex,
        bucket: Bucket<Self::Payload>,
    ) -> Result<(), OramError>;
    /// Inspects the bucket at `index` without counting it. Used by invariant scans only.
    fn peek_bucket(&self, index: TreeIndex) -> Result<&Bucket<Self::Payload>, OramError>;
    /// Total bucket reads.
    fn read_count(&self) -> u64;
    /// Total bucket writes.
    fn write_count(&self) -> u64;
    /// The ordered bucket touches since the last reset, if tracing is enabled.
    fn trace(&self) -> Option<&[BucketTouch]>;
    /// Zeroes all counters and clears the trace.
    fn reset_io(&mut self);

    /// Reads the buckets on the path to `leaf`, root first.
    fn read_path(&mut self, leaf: Leaf) -> Result<Vec<Bucket<Self::Payload>>, OramError> {
        let geometry = self.geometry();
        let mut result = Vec::with_capacity(usize::try_from(geometry.path_length())?);
        for index in geometry.path(leaf) {
            result.push(self.read_bucket(index)?);
        }
        Ok(result)
    }

    /// Overwrites the buckets on the path to `leaf`. `buckets` is ordered root first.
    fn write_path(
        &mut self,
        leaf: Leaf,
        buckets: Vec<Bucket<Self::Payload>>,
    ) -> Result<(), OramError> {
        let geometry = self.geometry();
        if u64::try_from(buckets.len())? != geometry.path_length() {
            return Err(OramError::InvalidConfigurationError(format!(
                "a path has {} buckets, got {}",
                geometry.path_length(),
                buckets.len()
            )));
        }
        for (index, bucket) in geometry.path(leaf).zip(buckets) {
            self.write_bucket(index, bucket)?;
        }
        Ok(())
    }
}

/// A tree of buckets backed by a `Vec`, which counts reads and writes per bucket.
#[derive(Debug)]
pub struct BucketStore<P: OramPayload> {
    // Index 0 is unused so that heap indices address the vector directly.
    buckets: Vec<Bucket<P>>,
    geometry: TreeGeometry,
    bucket_capacity: BucketSize,
    /// `reads[i]` tracks the total number of reads made to bucket `i`.
    pub reads: Vec<u64>,
    /// `writes[i]` tracks the total number of writes made to bucket `i`.
    pub writes: Vec<u64>,
    read_count: u64,
    write_count: u64,
    trace: Option<Vec<BucketTouch>>,
}

impl<P: OramPayload> BucketStore<P> {
    fn slot(&self, index: TreeIndex) -> Result<usize, OramError> {
        if !self.geometry.contains(index) {
            return Err(OramError::BucketOutOfRange { bucket: index });
        }
        Ok(usize::try_from(index)?)
    }

    /// The number of real blocks held by the whole tree.
    pub fn tree_occupancy(&self) -> usize {
        self.buckets.iter().map(Bucket::occupancy).sum()
    }
}

impl<P: OramPayload> PathStorage for BucketStore<P> {
    type Payload = P;

    fn new(
        geometry: TreeGeometry,
        bucket_capacity: BucketSize,
        record_trace: bool,
    ) -> Result<Self, OramError> {
        let length = usize::try_from(geometry.number_of_buckets() + 1)?;
        Ok(Self {
            buckets: vec![Bucket::new(bucket_capacity); length],
            geometry,
            bucket_capacity,
            reads: vec![0u64; length],
            writes: vec![0u64; length],
            read_count: 0,
            write_count: 0,
            trace: record_trace.then(Vec::new),
        })
    }

    fn geometry(&self) -> TreeGeometry {
        self.geometry
    }

    fn bucket_capacity(&self) -> BucketSize {
        self.bucket_capacity
    }

    fn read_bucket(&mut self, index: TreeIndex) -> Result<Bucket<P>, OramError> {
        log::debug!("Physical read -- {}", index);

        let slot = self.slot(index)?;
        self.reads[slot] += 1;
        self.read_count += 1;
        if let Some(trace) = self.trace.as_mut() {
            trace.push(BucketTouch::Read(index));
        }
        Ok(self.buckets[slot].clone())
    }

    fn write_bucket(&mut self, index: TreeIndex, bucket: Bucket<P>) -> Result<(), OramError> {
        log::debug!("Physical write -- {}", index);

        let slot = self.slot(index)?;
        let occupancy = bucket.occupancy();
        if bucket.capacity() != self.bucket_capacity || occupancy > self.bucket_capacity {
            return Err(OramError::BucketOverflow {
                bucket: index,
                occupancy,
                capacity: self.bucket_capacity,
            });
        }
        self.writes[slot] += 1;
        self.write_count += 1;
        if let Some(trace) = self.trace.as_mut() {
            trace.push(BucketTouch::Write(index));
        }
        self.buckets[slot] = bucket;
        Ok(())
    }

    fn peek_bucket(&self, index: TreeIndex) -> Result<&Bucket<P>, OramError> {
        let slot = self.slot(index)?;
        Ok(&self.buckets[slot])
    }

    fn read_count(&self) -> u64 {
        self.read_count
    }

    fn write_count(&self) -> u64 {
        self.write_count
    }

    fn trace(&self) -> Option<&[BucketTouch]> {
        self.trace.as_deref()
    }

    fn reset_io(&mut self) {
        self.reads.iter_mut().for_each(|count| *count = 0);
        self.writes.iter_mut().for_each(|count| *count = 0);
        self.read_count = 0;
        self.write_count = 0;
        if let Some(trace) = self.trace.as_mut() {
            trace.clear();
        }
    }
}
