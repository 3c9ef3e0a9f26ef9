// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Parameters of an ORAM instance and their validation.

use crate::{utils::MAXIMUM_TREE_HEIGHT, Address, BucketSize, OramError, StashSize};

/// The parameter "Z" from the Path ORAM literature that sets the number of blocks per bucket; typical values are 3 or 4.
/// Here we adopt the more conservative setting of 4.
pub const DEFAULT_BLOCKS_PER_BUCKET: BucketSize = 4;

/// The default number of logical blocks grouped into one megablock.
pub const DEFAULT_MEGABLOCK_SIZE: u64 = 4;

/// The default number of overflow blocks that the stash can store between accesses.
/// MegaBlocks scales this by the megablock size, since blocks enter and leave the stash a group at a time.
///
/// Under the tail bound `T * 14 * 0.6002^R` used by the counters, `R = 128` keeps the estimated
/// overflow probability below [`DEFAULT_MAX_OVERFLOW_PROBABILITY`] for every `T` up to `2^50` accesses.
pub const DEFAULT_STASH_OVERFLOW_SIZE: StashSize = 128;

/// The overflow probability above which the counter estimators emit a warning.
pub const DEFAULT_MAX_OVERFLOW_PROBABILITY: f64 = 1.0 / (1u64 << 40) as f64;

/// The constant in front of `ln N / ln ln N` in the FutORAMa cost estimate.
pub const DEFAULT_FUTORAMA_COST_SCALE: f64 = 4.0;

/// The access protocol an instance runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    /// Groups of blocks sharing a leaf.
    MegaBlocks,
    /// One leaf per block.
    PathOram,
    /// The hierarchical FutORAMa construction. Only available as a cost estimate.
    FutORAMa,
}

/// How much of the protocol actually runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Buckets carry payload bytes.
    Real,
    /// Buckets carry block identities only; reads return no value.
    Simulation,
    /// No tree is built; costs come from closed-form estimates.
    Counter,
}

/// The parameters of an ORAM instance.
///
/// ## Sizing
///
/// - Block capacity `N`: the number of logical blocks. Must be a power of two and at least 2.
/// - Blocks per bucket `Z`: must be at least 1. MegaBlocks buckets hold `Z * L` slots.
/// - Megablock size `L`: must be a power of two no larger than `N`. Ignored by Path ORAM.
/// - Stash overflow size: the number of blocks (per megablock member) that may remain in the stash
///   after eviction. Exceeding it is fatal.
#[derive(Clone, Debug, PartialEq)]
pub struct OramConfig {
    /// The number of logical blocks `N`.
    pub block_capacity: Address,
    /// The number of blocks per bucket `Z`.
    pub blocks_per_bucket: BucketSize,
    /// The megablock size `L`.
    pub megablock_size: u64,
    /// Stash overflow allowance before scaling by the megablock size.
    pub stash_overflow_size: StashSize,
    /// Estimated overflow probabilities above this value produce a warning.
    pub max_overflow_probability: f64,
    /// The FutORAMa cost constant.
    pub futorama_cost_scale: f64,
    /// Seeds the instance's random oracle.
    pub seed: u64,
    /// The access protocol.
    pub scheme: Scheme,
    /// The execution mode.
    pub mode: ExecutionMode,
    /// Whether a served MegaBlocks block may trade groups with a block of another fully stashed group.
    pub reshuffle_megablocks: bool,
    /// Whether the store records the ordered sequence of bucket touches.
    pub record_trace: bool,
    /// The number of accesses the overflow estimate is computed for. Defaults to `2N`.
    pub expected_accesses: Option<u64>,
    /// Path ORAM keeps its position map in client memory only below this many blocks, and
    /// otherwise stores it in a smaller Path ORAM, recursively. `None` keeps it local at every size.
    pub position_map_local_capacity: Option<Address>,
}

impl OramConfig {
    /// Returns a MegaBlocks configuration in Real mode with the default parameters.
    pub fn new(block_capacity: Address, seed: u64) -> Self {
        Self {
            block_capacity,
            blocks_per_bucket: DEFAULT_BLOCKS_PER_BUCKET,
            megablock_size: DEFAULT_MEGABLOCK_SIZE,
            stash_overflow_size: DEFAULT_STASH_OVERFLOW_SIZE,
            max_overflow_probability: DEFAULT_MAX_OVERFLOW_PROBABILITY,
            futorama_cost_scale: DEFAULT_FUTORAMA_COST_SCALE,
            seed,
            scheme: Scheme::MegaBlocks,
            mode: ExecutionMode::Real,
            reshuffle_megablocks: false,
            record_trace: false,
            expected_accesses: None,
            position_map_local_capacity: None,
        }
    }

    /// Sizes a configuration for `N = 2^exponent` the way the experiments do:
    /// a word of `w = exponent` bits, a block of `w^3` bits, and `L = w^2`
    /// rounded down to a power of two and clamped to `N / 2`.
    ///
    /// # Errors
    ///
    /// Fails if `exponent` is 0 or exceeds the largest supported tree height.
    pub fn from_exponent(exponent: u32, seed: u64) -> Result<Self, OramError> {
        if exponent == 0 || u64::from(exponent) > MAXIMUM_TREE_HEIGHT {
            return Err(OramError::InvalidConfigurationError(format!(
                "exponent {exponent} must lie in [1, {MAXIMUM_TREE_HEIGHT}]"
            )));
        }
        let block_capacity: Address = 1 << exponent;
        let word_bits = u64::from(exponent);
        let block_bits = word_bits.pow(3);
        let words_per_block = (block_bits / word_bits).max(1);
        let megablock_size = prev_power_of_two(words_per_block).min(block_capacity / 2);

        Ok(Self::new(block_capacity, seed).with_megablock_size(megablock_size))
    }

    /// Sets the scheme.
    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Sets the execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets `Z`.
    pub fn with_blocks_per_bucket(mut self, blocks_per_bucket: BucketSize) -> Self {
        self.blocks_per_bucket = blocks_per_bucket;
        self
    }

    /// Sets `L`.
    pub fn with_megablock_size(mut self, megablock_size: u64) -> Self {
        self.megablock_size = megablock_size;
        self
    }

    /// Sets the stash overflow allowance.
    pub fn with_stash_overflow_size(mut self, stash_overflow_size: StashSize) -> Self {
        self.stash_overflow_size = stash_overflow_size;
        self
    }

    /// Sets the warning threshold for estimated overflow probabilities.
    pub fn with_max_overflow_probability(mut self, max_overflow_probability: f64) -> Self {
        self.max_overflow_probability = max_overflow_probability;
        self
    }

    /// Sets the FutORAMa cost constant.
    pub fn with_futorama_cost_scale(mut self, futorama_cost_scale: f64) -> Self {
        self.futorama_cost_scale = futorama_cost_scale;
        self
    }

    /// Enables or disables megablock reshuffling.
    pub fn with_reshuffle_megablocks(mut self, reshuffle_megablocks: bool) -> Self {
        self.reshuffle_megablocks = reshuffle_megablocks;
        self
    }

    /// Enables or disables the bucket-touch trace.
    pub fn with_trace(mut self, record_trace: bool) -> Self {
        self.record_trace = record_trace;
        self
    }

    /// Sets the number of accesses the overflow estimate is computed for.
    pub fn with_expected_accesses(mut self, expected_accesses: u64) -> Self {
        self.expected_accesses = Some(expected_accesses);
        self
    }

    /// Sets the size below which the Path ORAM position map stays in client memory.
    pub fn with_position_map_local_capacity(mut self, local_capacity: Address) -> Self {
        self.position_map_local_capacity = Some(local_capacity);
        self
    }

    /// The group size actually used by the scheme: `L` for MegaBlocks, 1 otherwise.
    pub fn effective_megablock_size(&self) -> u64 {
        match self.scheme {
            Scheme::MegaBlocks => self.megablock_size,
            Scheme::PathOram | Scheme::FutORAMa => 1,
        }
    }

    /// The number of leaves of the bucket tree.
    pub fn number_of_leaves(&self) -> u64 {
        self.block_capacity / self.effective_megablock_size().max(1)
    }

    /// The number of slots per bucket.
    pub fn bucket_capacity(&self) -> Result<BucketSize, OramError> {
        Ok(self.blocks_per_bucket * usize::try_from(self.effective_megablock_size())?)
    }

    /// The number of blocks that may remain in the stash after eviction.
    pub fn stash_bound(&self) -> StashSize {
        self.stash_overflow_size * self.effective_megablock_size()
    }

    /// The number of accesses `T` used by the overflow estimate.
    pub fn expected_accesses(&self) -> u64 {
        self.expected_accesses
            .unwrap_or_else(|| self.block_capacity.saturating_mul(2))
    }

    /// Checks every parameter, returning an `InvalidConfigurationError` naming the first problem.
    pub fn validate(&self) -> Result<(), OramError> {
        let invalid = |message: String| Err(OramError::InvalidConfigurationError(message));

        if self.block_capacity < 2 || !self.block_capacity.is_power_of_two() {
            return invalid(format!(
                "block capacity {} must be a power of two and at least 2",
                self.block_capacity
            ));
        }
        if u64::from(self.block_capacity.ilog2()) > MAXIMUM_TREE_HEIGHT {
            return invalid(format!(
                "block capacity {} exceeds 2^{MAXIMUM_TREE_HEIGHT}",
                self.block_capacity
            ));
        }
        if self.blocks_per_bucket == 0 {
            return invalid("blocks per bucket must be at least 1".into());
        }
        if self.megablock_size == 0 || !self.megablock_size.is_power_of_two() {
            return invalid(format!(
                "megablock size {} must be a nonzero power of two",
                self.megablock_size
            ));
        }
        if self.megablock_size > self.block_capacity {
            return invalid(format!(
                "megablock size {} exceeds block capacity {}",
                self.megablock_size, self.block_capacity
            ));
        }
        if self.scheme == Scheme::FutORAMa && self.mode != ExecutionMode::Counter {
            return invalid("FutORAMa is only available in Counter mode".into());
        }
        if !(self.futorama_cost_scale.is_finite() && self.futorama_cost_scale > 0.0) {
            return invalid(format!(
                "FutORAMa cost scale {} must be positive",
                self.futorama_cost_scale
            ));
        }
        if self.position_map_local_capacity == Some(0) {
            return invalid("position map local capacity must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.max_overflow_probability) {
            return invalid(format!(
                "maximum overflow probability {} must lie in [0, 1]",
                self.max_overflow_probability
            ));
        }
        Ok(())
    }
}

fn prev_power_of_two(n: u64) -> u64 {
    debug_assert_ne!(n, 0);
    1 << n.ilog2()
}
