// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Common test utilities for the tree ORAM engines.

use crate::{
    config::OramConfig, megablocks::MegaBlocksOram, path_oram::PathOram, store::PathStorage,
    AccessProtocol, Address, BlockSize, BlockValue, BucketStore, OramError, Scheme,
};
use duplicate::duplicate_item;
use rand::{rngs::StdRng, Rng, SeedableRng};
use simplelog::{Config, WriteLogger};
use std::sync::Once;

static INIT: Once = Once::new();

// For use in manual testing and inspection.
pub(crate) fn init_logger() {
    INIT.call_once(|| {
        WriteLogger::init(log::LevelFilter::Info, Config::default(), std::io::stdout()).unwrap()
    })
}

pub(crate) trait Testable: AccessProtocol + Sized {
    fn scheme() -> Scheme;

    fn new_for_test(config: &OramConfig) -> Result<Self, OramError>;

    fn test_hook(&self) {
        self.verify_invariants().unwrap();
    }
}

#[duplicate_item(
    oram_type       scheme_variant;
    [PathOram]      [Scheme::PathOram];
    [MegaBlocksOram] [Scheme::MegaBlocks];
)]
impl<S: PathStorage> Testable for oram_type<S> {
    fn scheme() -> Scheme {
        scheme_variant
    }

    fn new_for_test(config: &OramConfig) -> Result<Self, OramError> {
        oram_type::new(config)
    }
}

fn test_config<T: Testable>(capacity: Address, megablock_size: u64) -> OramConfig {
    OramConfig::new(capacity, 0)
        .with_scheme(T::scheme())
        .with_megablock_size(megablock_size)
}

/// Tests the correctness of an ORAM type `T` on a workload of random reads and writes,
/// scanning the tree after every access.
pub(crate) fn test_correctness_random_workload<
    const B: BlockSize,
    T: Testable<Payload = BlockValue<B>>,
>(
    capacity: Address,
    megablock_size: u64,
    num_operations: u32,
) {
    init_logger();
    let mut rng = StdRng::seed_from_u64(0);

    let mut oram = T::new_for_test(&test_config::<T>(capacity, megablock_size)).unwrap();
    let mut mirror_array = vec![BlockValue::<B>::default(); capacity as usize];

    for _ in 0..num_operations {
        let random_index = rng.gen_range(0..capacity);
        let random_block_value = rng.gen::<BlockValue<B>>();

        let read_versus_write = rng.gen::<bool>();

        if read_versus_write {
            assert_eq!(
                oram.read(random_index).unwrap(),
                mirror_array[random_index as usize]
            );
        } else {
            assert_eq!(
                oram.write(random_index, random_block_value).unwrap(),
                mirror_array[random_index as usize]
            );
            mirror_array[random_index as usize] = random_block_value;
        }
        oram.test_hook();
    }

    for index in 0..capacity {
        assert_eq!(
            oram.read(index).unwrap(),
            mirror_array[index as usize],
            "{index}"
        )
    }

    oram.test_hook();
}

/// Tests the correctness of an ORAM type `T` on repeated passes of sequential accesses 0, 1, ..., `capacity`.
pub(crate) fn test_correctness_linear_workload<
    const B: BlockSize,
    T: Testable<Payload = BlockValue<B>>,
>(
    capacity: Address,
    megablock_size: u64,
    num_operations: u32,
) {
    init_logger();
    let mut rng = StdRng::seed_from_u64(0);

    let mut oram = T::new_for_test(&test_config::<T>(capacity, megablock_size)).unwrap();
    let mut mirror_array = vec![BlockValue::<B>::default(); capacity as usize];

    let num_passes = u64::from(num_operations) / capacity;

    for _ in 0..num_passes {
        for index in 0..capacity {
            let random_block_value = rng.gen::<BlockValue<B>>();

            let read_versus_write: bool = rng.gen::<bool>();

            if read_versus_write {
                assert_eq!(oram.read(index).unwrap(), mirror_array[index as usize]);
            } else {
                oram.write(index, random_block_value).unwrap();
                mirror_array[index as usize] = random_block_value;
            }
        }
    }

    for index in 0..capacity {
        assert_eq!(
            oram.read(index).unwrap(),
            mirror_array[index as usize],
            "{index}"
        )
    }

    oram.test_hook();
}

/// Runs `num_operations` random reads in Simulation mode under `runs` different oracle and workload seeds,
/// checking the stash against its bound after every access and the location invariant periodically.
///
/// At most one run in ten may end in `StashOverflow`, and the largest stash seen across runs must stay
/// within `4 * L * log2 N` blocks.
pub(crate) fn test_stash_stays_bounded<T: Testable<Payload = crate::Occupancy>>(
    capacity: Address,
    num_operations: u64,
    runs: u64,
) {
    init_logger();
    let megablock_size =
        test_config::<T>(capacity, crate::config::DEFAULT_MEGABLOCK_SIZE).effective_megablock_size();
    let mut overflowing_runs = 0;
    let mut max_high_water_mark = 0;

    for run in 0..runs {
        let config = OramConfig {
            seed: run,
            ..test_config::<T>(capacity, crate::config::DEFAULT_MEGABLOCK_SIZE)
        };
        let bound = config.stash_bound();
        let mut oram = T::new_for_test(&config).unwrap();
        let mut rng = StdRng::seed_from_u64(run.wrapping_mul(0x9e37_79b9).wrapping_add(1));

        let mut overflowed = false;
        for i in 0..num_operations {
            match oram.read(rng.gen_range(0..capacity)) {
                Ok(_) => {}
                Err(OramError::StashOverflow { .. }) => {
                    overflowed = true;
                    break;
                }
                Err(error) => panic!("run {run}: {error}"),
            }
            assert!(oram.stats().stash_size <= bound);
            if i % 256 == 0 {
                oram.test_hook();
            }
        }
        if overflowed {
            overflowing_runs += 1;
            continue;
        }

        let stats = oram.stats();
        assert_eq!(stats.accesses, num_operations);
        assert!(stats.stash_high_water_mark <= bound);
        max_high_water_mark = max_high_water_mark.max(stats.stash_high_water_mark);
        oram.test_hook();
    }

    let log_n = u64::from(capacity.ilog2());
    log::info!(
        "{:?}: N = {}, {} runs, {} overflowed, largest stash {} against log2 N = {}",
        T::scheme(),
        capacity,
        runs,
        overflowing_runs,
        max_high_water_mark,
        log_n
    );
    assert!(overflowing_runs * 10 <= runs);
    assert!(max_high_water_mark <= 4 * megablock_size * log_n);
}

/// Checks that every bucket is read exactly as often as it is written,
/// and that leaves are read roughly uniformly.
pub(crate) fn test_leaf_reads_are_uniform<T: Testable<Payload = crate::Occupancy>>(
    oram: &T,
    store: &BucketStore<crate::Occupancy>,
) {
    for (r, w) in store.reads.iter().zip(&store.writes) {
        assert_eq!(*r, *w);
    }

    let geometry = store.geometry();
    let first_leaf_index = geometry.leaf_index(0) as usize;
    let last_leaf_index = first_leaf_index + geometry.number_of_leaves() as usize;
    let leaf_reads = &store.reads[first_leaf_index..last_leaf_index];

    let total_reads: u64 = leaf_reads.iter().sum();
    assert_eq!(total_reads, oram.stats().accesses);
    let expected_reads_per_leaf = total_reads / geometry.number_of_leaves();

    for reads in leaf_reads {
        assert!(*reads > expected_reads_per_leaf - expected_reads_per_leaf / 2);
        assert!(*reads < expected_reads_per_leaf + expected_reads_per_leaf / 2);
    }
}

pub(crate) fn simulation_oram<T: Testable<Payload = crate::Occupancy>>(
    capacity: Address,
    num_operations: u64,
) -> T {
    let mut oram = T::new_for_test(&test_config::<T>(
        capacity,
        crate::config::DEFAULT_MEGABLOCK_SIZE,
    ))
    .unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    for _ in 0..num_operations {
        oram.read(rng.gen_range(0..capacity)).unwrap();
    }
    oram
}

macro_rules! create_correctness_test_block_value {
    ($function_name:ident, $oram_type: ident, $store_type: ident, $block_size: expr, $block_capacity:expr, $megablock_size: expr, $iterations_to_test: expr) => {
        paste::paste! {
            #[test]
            fn [<$function_name _ $oram_type:snake _ $block_capacity _ $block_size _ $megablock_size _ $iterations_to_test>]() {
                $function_name::<$block_size, $oram_type<$store_type<$block_size>>>($block_capacity, $megablock_size, $iterations_to_test);
            }
        }
    };
}

macro_rules! create_correctness_tests_for_workload_and_oram_type {
    ($function_name: ident, $oram_type: ident, $store_type: ident) => {
        create_correctness_test_block_value!($function_name, $oram_type, $store_type, 2, 2, 1, 10);
        create_correctness_test_block_value!($function_name, $oram_type, $store_type, 2, 2, 2, 10);
        create_correctness_test_block_value!($function_name, $oram_type, $store_type, 4, 8, 2, 100);
        create_correctness_test_block_value!($function_name, $oram_type, $store_type, 2, 8, 4, 100);
        create_correctness_test_block_value!($function_name, $oram_type, $store_type, 8, 8, 8, 100);
        create_correctness_test_block_value!($function_name, $oram_type, $store_type, 4, 16, 1, 100);
        create_correctness_test_block_value!($function_name, $oram_type, $store_type, 4, 32, 4, 100);
        // Block size 16 bytes, block capacity 64 blocks, megablocks of 4, testing with 100 operations
        create_correctness_test_block_value!($function_name, $oram_type, $store_type, 16, 64, 4, 100);
        create_correctness_test_block_value!($function_name, $oram_type, $store_type, 2, 8, 2, 1000);
    };
}

macro_rules! create_correctness_tests_for_oram_type {
    ($oram_type: ident, $store_type: ident) => {
        create_correctness_tests_for_workload_and_oram_type!(
            test_correctness_linear_workload,
            $oram_type,
            $store_type
        );
        create_correctness_tests_for_workload_and_oram_type!(
            test_correctness_random_workload,
            $oram_type,
            $store_type
        );
    };
}

macro_rules! create_stash_bound_tests_for_oram_type {
    ($oram_type: ident) => {
        paste::paste! {
            #[test]
            fn [<stash_stays_bounded_ $oram_type:snake _256>]() {
                test_stash_stays_bounded::<$oram_type<SimulationStore>>(1 << 8, 1 << 10, 8);
            }

            #[test]
            fn [<stash_stays_bounded_ $oram_type:snake _4096>]() {
                test_stash_stays_bounded::<$oram_type<SimulationStore>>(1 << 12, 1 << 13, 4);
            }

            // This test is #[ignore]'d because it takes tens of seconds to run without optimizations.
            #[test]
            #[ignore]
            fn [<stash_stays_bounded_ $oram_type:snake _65536>]() {
                test_stash_stays_bounded::<$oram_type<SimulationStore>>(1 << 16, 1 << 17, 2);
            }

            #[test]
            fn [<leaf_reads_are_uniform_ $oram_type:snake>]() {
                let oram = simulation_oram::<$oram_type<SimulationStore>>(32, 4000);
                test_leaf_reads_are_uniform(&oram, oram.store());
            }
        }
    };
}

pub(crate) use create_correctness_test_block_value;
pub(crate) use create_correctness_tests_for_oram_type;
pub(crate) use create_correctness_tests_for_workload_and_oram_type;
pub(crate) use create_stash_bound_tests_for_oram_type;
