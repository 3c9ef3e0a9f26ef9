// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! One handle over every scheme and execution mode.

use crate::{
    config::{ExecutionMode, OramConfig, Scheme},
    counter::{
        estimated_overflow_probability, CounterOram, OverflowProbabilityExceeded, ReferenceRatios,
    },
    megablocks::MegaBlocksOram,
    path_oram::PathOram,
    store::{BucketTouch, RealStore, SimulationStore},
    AccessProtocol, Address, BlockSize, BlockValue, IoCost, Leaf, Occupancy, OramError,
    OramStats, Operation,
};

#[derive(Debug)]
enum Backend<const B: BlockSize> {
    RealMegaBlocks(MegaBlocksOram<RealStore<B>>),
    RealPath(PathOram<RealStore<B>>),
    SimulationMegaBlocks(MegaBlocksOram<SimulationStore>),
    SimulationPath(PathOram<SimulationStore>),
    Counter(CounterOram),
}

/// An ORAM instance of `B`-byte blocks, running the configured scheme in the configured mode.
#[derive(Debug)]
pub struct OramInstance<const B: BlockSize> {
    backend: Backend<B>,
    config: OramConfig,
}

/// Validates `config` and builds the instance it describes.
///
/// # Errors
///
/// Returns an `InvalidConfigurationError` if `config` fails validation, for example when FutORAMa
/// is requested outside Counter mode.
pub fn initialize<const B: BlockSize>(config: &OramConfig) -> Result<OramInstance<B>, OramError> {
    log::info!(
        "initialize -- {:?} in {:?} mode, N = {}, B = {}, seed = {}",
        config.scheme,
        config.mode,
        config.block_capacity,
        B,
        config.seed
    );
    config.validate()?;

    let backend = match (config.mode, config.scheme) {
        (ExecutionMode::Counter, _) => Backend::Counter(CounterOram::new(config)?),
        (ExecutionMode::Real, Scheme::MegaBlocks) => {
            Backend::RealMegaBlocks(MegaBlocksOram::new(config)?)
        }
        (ExecutionMode::Real, Scheme::PathOram) => Backend::RealPath(PathOram::new(config)?),
        (ExecutionMode::Simulation, Scheme::MegaBlocks) => {
            Backend::SimulationMegaBlocks(MegaBlocksOram::new(config)?)
        }
        (ExecutionMode::Simulation, Scheme::PathOram) => {
            Backend::SimulationPath(PathOram::new(config)?)
        }
        (_, Scheme::FutORAMa) => {
            return Err(OramError::InvalidConfigurationError(
                "FutORAMa is only available in Counter mode".into(),
            ))
        }
    };

    Ok(OramInstance {
        backend,
        config: config.clone(),
    })
}

fn without_payload<const B: BlockSize>(operation: Operation<BlockValue<B>>) -> Operation<Occupancy> {
    match operation {
        Operation::Read => Operation::Read,
        Operation::Write(_) => Operation::Write(Occupancy),
    }
}

impl<const B: BlockSize> OramInstance<B> {
    /// Performs one logical access. The returned value is the block's previous contents in Real mode
    /// and `None` otherwise, paired with the bucket operations the access cost.
    pub fn access(
        &mut self,
        address: Address,
        operation: Operation<BlockValue<B>>,
    ) -> Result<(Option<BlockValue<B>>, IoCost), OramError> {
        match &mut self.backend {
            Backend::RealMegaBlocks(oram) => {
                let access = oram.access(address, operation)?;
                Ok((Some(access.value), access.io_cost))
            }
            Backend::RealPath(oram) => {
                let access = oram.access(address, operation)?;
                Ok((Some(access.value), access.io_cost))
            }
            Backend::SimulationMegaBlocks(oram) => {
                let access = oram.access(address, without_payload(operation))?;
                Ok((None, access.io_cost))
            }
            Backend::SimulationPath(oram) => {
                let access = oram.access(address, without_payload(operation))?;
                Ok((None, access.io_cost))
            }
            Backend::Counter(counter) => Ok((None, counter.access(address)?)),
        }
    }

    /// Reads the block at `address`.
    pub fn read(&mut self, address: Address) -> Result<Option<BlockValue<B>>, OramError> {
        Ok(self.access(address, Operation::Read)?.0)
    }

    /// Writes `value` at `address`, returning the previous contents in Real mode.
    pub fn write(
        &mut self,
        address: Address,
        value: BlockValue<B>,
    ) -> Result<Option<BlockValue<B>>, OramError> {
        Ok(self.access(address, Operation::Write(value))?.0)
    }

    /// The configuration the instance was built from.
    pub fn config(&self) -> &OramConfig {
        &self.config
    }

    /// The number of logical blocks.
    pub fn block_capacity(&self) -> Address {
        self.config.block_capacity
    }

    /// Running statistics.
    pub fn stats(&self) -> OramStats {
        match &self.backend {
            Backend::RealMegaBlocks(oram) => oram.stats(),
            Backend::RealPath(oram) => oram.stats(),
            Backend::SimulationMegaBlocks(oram) => oram.stats(),
            Backend::SimulationPath(oram) => oram.stats(),
            Backend::Counter(counter) => counter.stats(),
        }
    }

    /// The ordered bucket touches since initialization. `None` in Counter mode or when tracing is off.
    pub fn trace(&self) -> Option<&[BucketTouch]> {
        match &self.backend {
            Backend::RealMegaBlocks(oram) => oram.trace(),
            Backend::RealPath(oram) => oram.trace(),
            Backend::SimulationMegaBlocks(oram) => oram.trace(),
            Backend::SimulationPath(oram) => oram.trace(),
            Backend::Counter(_) => None,
        }
    }

    /// The current leaf of every address. `None` in Counter mode.
    pub fn position_snapshot(&self) -> Option<Vec<Leaf>> {
        match &self.backend {
            Backend::RealMegaBlocks(oram) => Some(oram.position_snapshot()),
            Backend::RealPath(oram) => Some(oram.position_snapshot()),
            Backend::SimulationMegaBlocks(oram) => Some(oram.position_snapshot()),
            Backend::SimulationPath(oram) => Some(oram.position_snapshot()),
            Backend::Counter(_) => None,
        }
    }

    /// Scans the tree and the stash. Always succeeds in Counter mode.
    pub fn verify_invariants(&self) -> Result<(), OramError> {
        match &self.backend {
            Backend::RealMegaBlocks(oram) => oram.verify_invariants(),
            Backend::RealPath(oram) => oram.verify_invariants(),
            Backend::SimulationMegaBlocks(oram) => oram.verify_invariants(),
            Backend::SimulationPath(oram) => oram.verify_invariants(),
            Backend::Counter(_) => Ok(()),
        }
    }

    /// Overflow warnings raised by the Counter estimator.
    pub fn warnings(&self) -> &[OverflowProbabilityExceeded] {
        match &self.backend {
            Backend::Counter(counter) => counter.warnings(),
            _ => &[],
        }
    }

    /// The estimated probability that the configured number of accesses overflows the stash.
    pub fn overflow_probability(&self) -> f64 {
        match &self.backend {
            Backend::Counter(counter) => counter.overflow_probability(),
            _ => estimated_overflow_probability(&self.config, self.config.scheme),
        }
    }

    /// The size of one physical bucket in payload bytes.
    pub fn bucket_bytes(&self) -> Result<u64, OramError> {
        Ok(u64::try_from(self.config.bucket_capacity()? * B)?)
    }

    /// Payload bytes moved per logical access.
    pub fn bandwidth_overhead(&self) -> Result<f64, OramError> {
        Ok(self.stats().bandwidth_overhead(self.bucket_bytes()?))
    }

    /// The bucket operations so far compared with the asymptotic references, taking `B = L`.
    pub fn reference_ratios(&self) -> ReferenceRatios {
        let stats = self.stats();
        ReferenceRatios::new(
            stats.bucket_reads + stats.bucket_writes,
            stats.accesses,
            self.config.block_capacity,
            self.config.megablock_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_logger;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use static_assertions::assert_impl_all;

    assert_impl_all!(OramInstance<64>: Send);

    fn run_workload<const B: BlockSize>(oram: &mut OramInstance<B>, accesses: u64, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let capacity = oram.block_capacity();
        for _ in 0..accesses {
            let address = rng.gen_range(0..capacity);
            if rng.gen::<bool>() {
                oram.read(address).unwrap();
            } else {
                oram.write(address, rng.gen()).unwrap();
            }
        }
    }

    #[test]
    fn real_and_simulation_touch_the_same_buckets() {
        init_logger();
        for scheme in [Scheme::MegaBlocks, Scheme::PathOram] {
            let config = OramConfig::new(64, 11)
                .with_scheme(scheme)
                .with_megablock_size(4)
                .with_trace(true);
            let mut real = initialize::<8>(&config).unwrap();
            let mut simulation =
                initialize::<8>(&config.clone().with_mode(ExecutionMode::Simulation)).unwrap();

            run_workload(&mut real, 300, 1);
            run_workload(&mut simulation, 300, 1);

            assert_eq!(real.trace().unwrap(), simulation.trace().unwrap());
            assert_eq!(real.position_snapshot(), simulation.position_snapshot());
            let (real_stats, simulation_stats) = (real.stats(), simulation.stats());
            assert_eq!(real_stats.bucket_reads, simulation_stats.bucket_reads);
            assert_eq!(real_stats.bucket_writes, simulation_stats.bucket_writes);
            assert_eq!(real_stats.stash_size, simulation_stats.stash_size);
        }
    }

    #[test]
    fn same_seed_same_trace() {
        let config = OramConfig::new(128, 5)
            .with_mode(ExecutionMode::Simulation)
            .with_reshuffle_megablocks(true)
            .with_trace(true);
        let mut first = initialize::<0>(&config).unwrap();
        let mut second = initialize::<0>(&config).unwrap();
        run_workload(&mut first, 200, 2);
        run_workload(&mut second, 200, 2);
        assert_eq!(first.trace(), second.trace());
        assert_eq!(first.position_snapshot(), second.position_snapshot());

        let reseeded = OramConfig { seed: 6, ..config };
        let mut third = initialize::<0>(&reseeded).unwrap();
        run_workload(&mut third, 200, 2);
        assert_ne!(first.position_snapshot(), third.position_snapshot());
    }

    #[test]
    fn counter_tracks_simulation() {
        for scheme in [Scheme::MegaBlocks, Scheme::PathOram] {
            let config = OramConfig::new(1 << 10, 0)
                .with_scheme(scheme)
                .with_mode(ExecutionMode::Simulation);
            let mut simulation = initialize::<0>(&config).unwrap();
            let mut counter =
                initialize::<0>(&config.clone().with_mode(ExecutionMode::Counter)).unwrap();
            run_workload(&mut simulation, 2 << 10, 3);
            run_workload(&mut counter, 2 << 10, 3);

            let measured = simulation.stats().io_overhead();
            let estimated = counter.stats().io_overhead();
            assert!((measured - estimated).abs() <= 0.05 * measured);
        }
    }

    #[test]
    fn modes_differ_only_in_returned_values() {
        let config = OramConfig::new(16, 0).with_megablock_size(2);
        let value = BlockValue::from_bytes(b"ab");

        let mut real = initialize::<2>(&config).unwrap();
        assert_eq!(real.write(3, value).unwrap(), Some(BlockValue::default()));
        assert_eq!(real.read(3).unwrap(), Some(value));

        let mut simulation =
            initialize::<2>(&config.clone().with_mode(ExecutionMode::Simulation)).unwrap();
        assert_eq!(simulation.write(3, value).unwrap(), None);
        assert_eq!(simulation.read(3).unwrap(), None);

        let mut counter = initialize::<2>(&config.with_mode(ExecutionMode::Counter)).unwrap();
        let (returned, cost) = counter.access(3, Operation::Read).unwrap();
        assert_eq!(returned, None);
        assert_eq!(cost, 2 * 4);
        assert!(counter.trace().is_none());
        assert!(counter.position_snapshot().is_none());
    }

    #[test]
    fn futorama_requires_counter_mode() {
        let config = OramConfig::new(1 << 12, 0).with_scheme(Scheme::FutORAMa);
        assert!(matches!(
            initialize::<64>(&config),
            Err(OramError::InvalidConfigurationError(_))
        ));
        let mut counter = initialize::<64>(&config.with_mode(ExecutionMode::Counter)).unwrap();
        assert!(counter.read(0).unwrap().is_none());
        assert_eq!(counter.stats().accesses, 1);
    }

    #[test]
    fn bandwidth_is_bucket_bytes_per_access() {
        let config = OramConfig::new(64, 0).with_megablock_size(2);
        let mut oram = initialize::<32>(&config).unwrap();
        oram.read(0).unwrap();
        // Z * L = 8 slots of 32 bytes, 6 buckets read and 6 written.
        assert_eq!(oram.bucket_bytes().unwrap(), 256);
        assert_eq!(oram.bandwidth_overhead().unwrap(), 12.0 * 256.0);
        oram.verify_invariants().unwrap();
    }

    #[test]
    fn invalid_block_id_is_recoverable() {
        let config = OramConfig::new(16, 0);
        let mut oram = initialize::<4>(&config).unwrap();
        assert_eq!(
            oram.read(16),
            Err(OramError::InvalidBlockId {
                address: 16,
                capacity: 16
            })
        );
        assert!(oram.read(0).is_ok());
        assert_eq!(oram.stats().accesses, 1);
    }
}
