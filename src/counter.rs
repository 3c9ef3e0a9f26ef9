// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Closed-form cost estimates, for comparing schemes at sizes too large to simulate.

use crate::{
    config::{OramConfig, Scheme},
    position_map::recursion_levels,
    Address, IoCost, OramError, OramStats, StashSize,
};
use std::fmt;

// The per-bucket stash tail bound of Path ORAM with Z = 4: Pr[stash > R] <= 14 * 0.6002^R.
const PATH_ORAM_TAIL_FACTOR: f64 = 14.0;
const PATH_ORAM_TAIL_BASE: f64 = 0.6002;

/// `ln N / ln ln N`. The denominator is clamped to 1 for `N < e^e`, where `ln ln N` is at most 1.
pub fn log_n_over_log_log_n(block_capacity: Address) -> f64 {
    let ln_n = (block_capacity as f64).ln();
    ln_n / ln_n.ln().max(1.0)
}

/// The branching factor `q = ceil(sqrt(B))` of the hierarchical reference construction, at least 2.
pub fn branching_factor(words_per_block: u64) -> f64 {
    (words_per_block as f64).sqrt().ceil().max(2.0)
}

/// The amortized I/O bound `4 log_q N + 2 + 2/q + 20/(q-1) + 16/B` of the hierarchical reference construction.
pub fn amortized_reference_bound(block_capacity: Address, words_per_block: u64) -> f64 {
    let q = branching_factor(words_per_block);
    let b = words_per_block.max(1) as f64;
    let log_q_n = (block_capacity as f64).ln() / q.ln();
    4.0 * log_q_n + 2.0 + 2.0 / q + 20.0 / (q - 1.0) + 16.0 / b
}

fn path_length(number_of_leaves: Address) -> f64 {
    (number_of_leaves as f64).log2() + 1.0
}

/// The expected bucket operations per access of `scheme` under `config`.
///
/// Path ORAM pays for one path each way in the data tree and in every position-map ORAM below it.
pub fn expected_cost_per_access(config: &OramConfig, scheme: Scheme) -> f64 {
    match scheme {
        Scheme::PathOram => recursion_levels(
            config.block_capacity,
            config.position_map_local_capacity,
        )
        .into_iter()
        .map(|capacity| 2.0 * path_length(capacity))
        .sum(),
        Scheme::MegaBlocks => {
            let leaves = config.block_capacity / config.megablock_size.max(1);
            2.0 * path_length(leaves)
        }
        Scheme::FutORAMa => {
            config.futorama_cost_scale * 2.0 * log_n_over_log_log_n(config.block_capacity)
        }
    }
}

/// An upper estimate of the probability that any of `config.expected_accesses()` accesses overflows the stash.
pub fn estimated_overflow_probability(config: &OramConfig, scheme: Scheme) -> f64 {
    let accesses = config.expected_accesses() as f64;
    let estimate = match scheme {
        Scheme::PathOram => {
            accesses
                * PATH_ORAM_TAIL_FACTOR
                * PATH_ORAM_TAIL_BASE.powf(config.stash_overflow_size as f64)
        }
        Scheme::MegaBlocks => {
            let groups_in_stash =
                config.stash_bound() as f64 / config.effective_megablock_size() as f64;
            accesses * PATH_ORAM_TAIL_FACTOR * PATH_ORAM_TAIL_BASE.powf(groups_in_stash)
        }
        Scheme::FutORAMa => {
            accesses
                * log_n_over_log_log_n(config.block_capacity)
                * (-(config.megablock_size as f64) / 6.0).exp()
        }
    };
    estimate.min(1.0)
}

/// Raised, but never returned as an error, when a scheme's estimated overflow probability
/// exceeds the configured maximum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OverflowProbabilityExceeded {
    /// The scheme being estimated.
    pub scheme: Scheme,
    /// The estimated probability.
    pub estimate: f64,
    /// The configured maximum.
    pub threshold: f64,
}

impl fmt::Display for OverflowProbabilityExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} overflow probability estimate {:e} exceeds {:e}",
            self.scheme, self.estimate, self.threshold
        )
    }
}

/// Measured cost put side by side with the asymptotic references.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReferenceRatios {
    /// `4 log_q N + 2 + 2/q + 20/(q-1) + 16/B`.
    pub amortized_bound: f64,
    /// Total operations over `T` times the amortized bound.
    pub to_amortized_bound: f64,
    /// Total operations over `T log_q N`.
    pub to_log_q_n: f64,
    /// Total operations over `T ln N / ln ln N`.
    pub to_log_n_over_log_log_n: f64,
    /// Total operations over `T log N / log B`.
    pub to_log_n_over_log_b: f64,
}

impl ReferenceRatios {
    /// Compares `total_operations` over `accesses` accesses against the references for `N` and `B`.
    pub fn new(
        total_operations: IoCost,
        accesses: u64,
        block_capacity: Address,
        words_per_block: u64,
    ) -> Self {
        let total = total_operations as f64;
        let t = accesses.max(1) as f64;
        let ln_n = (block_capacity as f64).ln();
        let q = branching_factor(words_per_block);
        let amortized_bound = amortized_reference_bound(block_capacity, words_per_block);
        let log_b = (words_per_block.max(2) as f64).ln();
        Self {
            amortized_bound,
            to_amortized_bound: total / (t * amortized_bound),
            to_log_q_n: total / (t * ln_n / q.ln()),
            to_log_n_over_log_log_n: total / (t * log_n_over_log_log_n(block_capacity)),
            to_log_n_over_log_b: total / (t * ln_n / log_b),
        }
    }
}

/// A stand-in for an ORAM that only keeps score.
///
/// Each access charges the scheme's expected cost. Fractional costs accumulate,
/// so the charges reported so far always sum to the floor of the running total.
#[derive(Debug, Clone)]
pub struct CounterOram {
    scheme: Scheme,
    block_capacity: Address,
    words_per_block: u64,
    cost_per_access: f64,
    accumulated_cost: f64,
    charged: IoCost,
    accesses: u64,
    stash_bound: StashSize,
    overflow_probability: f64,
    warnings: Vec<OverflowProbabilityExceeded>,
}

impl CounterOram {
    /// Returns a new counter for `config.scheme`.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `config` fails validation.
    pub fn new(config: &OramConfig) -> Result<Self, OramError> {
        config.validate()?;
        let scheme = config.scheme;
        let cost_per_access = expected_cost_per_access(config, scheme);
        let overflow_probability = estimated_overflow_probability(config, scheme);
        log::info!(
            "CounterOram::new(scheme = {:?}, capacity = {}, cost per access = {})",
            scheme,
            config.block_capacity,
            cost_per_access
        );

        let mut warnings = Vec::new();
        if overflow_probability > config.max_overflow_probability {
            let warning = OverflowProbabilityExceeded {
                scheme,
                estimate: overflow_probability,
                threshold: config.max_overflow_probability,
            };
            log::warn!("{}", warning);
            warnings.push(warning);
        }

        Ok(Self {
            scheme,
            block_capacity: config.block_capacity,
            words_per_block: config.megablock_size,
            cost_per_access,
            accumulated_cost: 0.0,
            charged: 0,
            accesses: 0,
            stash_bound: config.stash_bound(),
            overflow_probability,
            warnings,
        })
    }

    /// Charges one access to `address`, returning the whole bucket operations it adds.
    pub fn access(&mut self, address: Address) -> Result<IoCost, OramError> {
        if address >= self.block_capacity {
            return Err(OramError::InvalidBlockId {
                address,
                capacity: self.block_capacity,
            });
        }
        self.accumulated_cost += self.cost_per_access;
        // Truncation is the intended rounding here.
        let total = self.accumulated_cost.floor() as IoCost;
        let cost = total - self.charged;
        self.charged = total;
        self.accesses += 1;
        log::debug!("Counter access -- address {}, cost {}", address, cost);
        Ok(cost)
    }

    /// The scheme being estimated.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The number of logical blocks.
    pub fn block_capacity(&self) -> Address {
        self.block_capacity
    }

    /// The expected bucket operations per access.
    pub fn cost_per_access(&self) -> f64 {
        self.cost_per_access
    }

    /// The estimated stash overflow probability over the configured number of accesses.
    pub fn overflow_probability(&self) -> f64 {
        self.overflow_probability
    }

    /// The stash bound the estimate was made for.
    pub fn stash_bound(&self) -> StashSize {
        self.stash_bound
    }

    /// Warnings raised so far.
    pub fn warnings(&self) -> &[OverflowProbabilityExceeded] {
        &self.warnings
    }

    /// The accumulated charges compared with the asymptotic references.
    pub fn reference_ratios(&self) -> ReferenceRatios {
        ReferenceRatios::new(
            self.charged,
            self.accesses,
            self.block_capacity,
            self.words_per_block,
        )
    }

    /// Running statistics. Charges are split evenly between reads and writes; there is no stash.
    pub fn stats(&self) -> OramStats {
        OramStats {
            bucket_reads: self.charged - self.charged / 2,
            bucket_writes: self.charged / 2,
            stash_touches: 0,
            stash_size: 0,
            stash_high_water_mark: 0,
            accesses: self.accesses,
        }
    }
}
