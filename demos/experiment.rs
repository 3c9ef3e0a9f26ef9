// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Runs `T = 2N` uniformly random accesses against one scheme and prints its overheads.
//!
//! Usage: `cargo run --release --example experiment -- [exponent] [megablocks|path|futorama] [real|simulation|counter] [seed] [position map local capacity]`
//!
//! The last argument only affects Path ORAM: at or above that many blocks its position map is stored recursively.

use megablocks_oram::{
    initialize, Address, BlockValue, ExecutionMode, OramConfig, OramError, Scheme,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use simplelog::{Config, SimpleLogger};

const BLOCK_SIZE: usize = 64;

fn parse_scheme(argument: Option<&str>) -> Result<Scheme, OramError> {
    match argument {
        None | Some("megablocks") => Ok(Scheme::MegaBlocks),
        Some("path") => Ok(Scheme::PathOram),
        Some("futorama") => Ok(Scheme::FutORAMa),
        Some(other) => Err(OramError::InvalidConfigurationError(format!(
            "unknown scheme '{other}', expected megablocks, path or futorama"
        ))),
    }
}

fn parse_mode(argument: Option<&str>) -> Result<ExecutionMode, OramError> {
    match argument {
        None | Some("simulation") => Ok(ExecutionMode::Simulation),
        Some("real") => Ok(ExecutionMode::Real),
        Some("counter") => Ok(ExecutionMode::Counter),
        Some(other) => Err(OramError::InvalidConfigurationError(format!(
            "unknown mode '{other}', expected real, simulation or counter"
        ))),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    SimpleLogger::init(log::LevelFilter::Info, Config::default())?;

    let arguments: Vec<String> = std::env::args().skip(1).collect();
    let exponent: u32 = match arguments.first() {
        Some(exponent) => exponent.parse()?,
        None => 12,
    };
    let scheme = parse_scheme(arguments.get(1).map(String::as_str))?;
    let mode = match scheme {
        Scheme::FutORAMa => ExecutionMode::Counter,
        _ => parse_mode(arguments.get(2).map(String::as_str))?,
    };
    let seed: u64 = match arguments.get(3) {
        Some(seed) => seed.parse()?,
        None => 0,
    };

    let mut config = OramConfig::from_exponent(exponent, seed)?
        .with_scheme(scheme)
        .with_mode(mode);
    if let Some(local_capacity) = arguments.get(4) {
        config = config.with_position_map_local_capacity(local_capacity.parse()?);
    }
    let mut oram = initialize::<BLOCK_SIZE>(&config)?;

    let capacity: Address = config.block_capacity;
    let accesses = config.expected_accesses();
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..accesses {
        let address = rng.gen_range(0..capacity);
        if rng.gen::<bool>() {
            oram.read(address)?;
        } else {
            oram.write(address, rng.gen::<BlockValue<BLOCK_SIZE>>())?;
        }
    }

    report(&oram, &config)?;
    Ok(())
}

fn report(
    oram: &megablocks_oram::OramInstance<BLOCK_SIZE>,
    config: &OramConfig,
) -> Result<(), OramError> {
    let stats = oram.stats();
    let ratios = oram.reference_ratios();

    println!(
        "{:?} ({:?}), N = {}, Z = {}, L = {}, T = {}",
        config.scheme,
        config.mode,
        config.block_capacity,
        config.blocks_per_bucket,
        config.effective_megablock_size(),
        stats.accesses
    );
    println!(
        "Total bucket operations: {}",
        stats.bucket_reads + stats.bucket_writes
    );
    println!("I/O overhead per access: {:.3}", stats.io_overhead());
    println!(
        "Bandwidth overhead per access: {:.1} bytes",
        oram.bandwidth_overhead()?
    );
    println!(
        "Stash: {} blocks now, {} at most, {} touches",
        stats.stash_size, stats.stash_high_water_mark, stats.stash_touches
    );
    println!(
        "Theoretical amortized cost (4 log_q N + 2 + o(1)): {:.3}",
        ratios.amortized_bound
    );
    println!(
        "Ratio to T * amortized cost: {:.3}",
        ratios.to_amortized_bound
    );
    println!("Ratio to T * log_q N: {:.3}", ratios.to_log_q_n);
    println!(
        "Ratio to T * ln N / ln ln N: {:.3}",
        ratios.to_log_n_over_log_log_n
    );
    println!("Ratio to T * log N / log B: {:.3}", ratios.to_log_n_over_log_b);
    let error_probability = oram.overflow_probability();
    if error_probability > 0.0 {
        println!("Log2(error probability): {:.1}", error_probability.log2());
    } else {
        println!("Log2(error probability) < -1000");
    }
    for warning in oram.warnings() {
        println!("Warning: {}", warning);
    }
    Ok(())
}
