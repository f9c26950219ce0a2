use anyhow::Result;
use clap::Parser;
use log::info;
use rand::prelude::*;
use std::path::PathBuf;
use walker_common::SimConfig;

// Define modules used by main
mod counter;
mod histogram;
mod messenger;
mod particle;
mod pool;
mod queue;
mod simulation;
mod substrate;

use simulation::Simulation;

/// Distributed random-walk particle simulation.
///
/// The domain is a `width x height` grid of ranks, each owning a
/// `bound x bound` region. Every rank spawns `start_particles` walkers;
/// a walker finishes after `max_iterations` steps and is tallied where
/// it died. The per-position, per-origin histogram lands in one shared
/// binary file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Side length of each rank's square sub-region
    bound: u32,

    /// Number of rank columns in the domain grid
    width: u32,

    /// Number of rank rows in the domain grid
    height: u32,

    /// Step budget per particle
    max_iterations: u64,

    /// Particles spawned per rank
    start_particles: u64,

    /// Probability of stepping left
    p_left: f64,

    /// Probability of stepping right
    p_right: f64,

    /// Probability of stepping up
    p_up: f64,

    /// Probability of stepping down (residual mass also lands here)
    p_down: f64,

    /// Base RNG seed; each rank offsets it by its rank id. Random when
    /// omitted.
    #[arg(long)]
    seed: Option<u64>,

    /// Output histogram file
    #[arg(long, default_value = "data.bin")]
    output: PathBuf,
}

fn main() -> Result<()> {
    // Initialize the logger
    env_logger::init();

    let args = Args::parse();
    let config = SimConfig {
        bound: args.bound,
        width: args.width,
        height: args.height,
        max_iterations: args.max_iterations,
        start_particles: args.start_particles,
        p_left: args.p_left,
        p_right: args.p_right,
        p_up: args.p_up,
        p_down: args.p_down,
        seed: args.seed.unwrap_or_else(|| rand::rng().random()),
        output: args.output,
    };
    config.validate()?;

    info!(
        "Starting walker engine: {}x{} ranks, bound {}, {} particles total",
        config.width,
        config.height,
        config.bound,
        config.total_particles()
    );

    // An invariant violation on any rank thread has to take the whole
    // process down, as it would in the one-process-per-rank deployment.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::exit(134);
    }));

    #[cfg(feature = "mpi")]
    return run_mpi(config);
    #[cfg(not(feature = "mpi"))]
    run_local(config)
}

/// Default mode: every rank lives in this process. Each gets its own
/// simulation thread (which in turn spawns its messenger thread) over a
/// shared in-process cluster.
#[cfg(not(feature = "mpi"))]
fn run_local(config: SimConfig) -> Result<()> {
    use crate::substrate::{LocalCluster, Substrate};
    use anyhow::Context;

    let endpoints = LocalCluster::new(config.rank_count(), &config.output);
    let mut handles = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let config = config.clone();
        let handle = std::thread::Builder::new()
            .name(format!("rank-{}", endpoint.rank()))
            .spawn(move || Simulation::new(endpoint, config)?.run())
            .context("spawning a rank thread")?;
        handles.push(handle);
    }

    let mut grand_total = 0;
    for handle in handles {
        let report = handle
            .join()
            .map_err(|_| anyhow::anyhow!("a rank thread panicked"))??;
        info!(
            "rank {}: {} particles recorded locally",
            report.rank, report.recorded
        );
        grand_total += report.recorded;
    }
    info!(
        "{} of {} particles accounted for; histogram written to {}",
        grand_total,
        config.total_particles(),
        config.output.display()
    );
    Ok(())
}

/// MPI mode: this process is one rank of a world launched under
/// `mpirun`, exactly one simulation and one messenger thread per
/// process.
#[cfg(feature = "mpi")]
fn run_mpi(config: SimConfig) -> Result<()> {
    use crate::substrate::mpi_world::MpiWorld;

    let substrate = MpiWorld::initialize(config.output.clone())?;
    let report = Simulation::new(substrate, config)?.run()?;
    info!(
        "rank {}: {} particles recorded locally",
        report.rank, report.recorded
    );
    Ok(())
}
