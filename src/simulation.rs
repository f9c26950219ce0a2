//! Per-rank control loop.
//!
//! Each tick advances every resident particle one step and classifies it
//! as still walking, migrating to another rank, or finished in place.
//! Termination is global: a rank keeps looping until the broadcast
//! finished-count reports account for every particle spawned anywhere.

use crate::histogram::Histogram;
use crate::messenger::Messenger;
use crate::particle::Particle;
use crate::pool::ParticlePool;
use crate::substrate::Substrate;
use anyhow::Result;
use log::{debug, info, trace};
use rand::prelude::*;
use walker_common::{RankGrid, Region, SimConfig, SlabLayout};

/// Ticks between inbound-queue drains. Incoming particles sit with the
/// messenger for at most this many pool sweeps before joining the walk.
const DRAIN_INTERVAL: u64 = 100;

/// What one rank can say about the run after global termination.
#[derive(Debug)]
pub struct RankReport {
    pub rank: usize,
    /// Global finished count observed when this rank terminated.
    pub finished_particles: u64,
    /// Particles recorded into this rank's own histogram.
    pub recorded: u64,
    pub histogram: Histogram,
}

/// One rank's simulation: the pool of resident walkers, the local
/// histogram, and the messenger doing its communication in the
/// background.
pub struct Simulation {
    config: SimConfig,
    messenger: Messenger,
    grid: RankGrid,
    region: Region,
    pool: ParticlePool<Particle>,
    histogram: Histogram,
    rng: StdRng,
    /// Global finished total as far as this rank knows.
    finished_particles: u64,
    /// Locally finished particles not yet broadcast.
    delta: u64,
    ticks: u64,
}

impl Simulation {
    /// Spawns the messenger over `substrate`, waits for the rank
    /// handshake, and seeds the pool with this rank's starting particles.
    pub fn new<S: Substrate>(substrate: S, config: SimConfig) -> Result<Self> {
        let messenger = Messenger::spawn(substrate)?;
        let grid = config.grid();
        anyhow::ensure!(
            messenger.size() == grid.rank_count(),
            "substrate provides {} ranks but the domain needs {}",
            messenger.size(),
            grid.rank_count()
        );
        let region = grid.region_of(messenger.rank());
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(region.rank as u64));

        // Capacity covers the global spawn total: in the worst case every
        // particle walks onto this rank before finishing.
        let mut pool = ParticlePool::with_capacity(config.total_particles() as usize);
        for _ in 0..config.start_particles {
            pool.push_front(Particle::spawn(&region, region.rank as i32, &mut rng));
        }
        let histogram = Histogram::new(grid.bound, grid.rank_count());

        info!(
            "rank {}: region [{}, {}] x [{}, {}], grace {}, {} particles seeded",
            region.rank,
            region.min_x,
            region.max_x,
            region.min_y,
            region.max_y,
            region.grace,
            pool.len()
        );
        Ok(Self {
            config,
            messenger,
            grid,
            region,
            pool,
            histogram,
            rng,
            finished_particles: 0,
            delta: 0,
            ticks: 0,
        })
    }

    /// Runs to global termination, writes this rank's histogram slab and
    /// shuts the messenger down.
    pub fn run(mut self) -> Result<RankReport> {
        let total = self.config.total_particles();
        while self.finished_particles < total {
            self.step_residents();

            if self.pool.is_empty() {
                // Fold in remote reports first, then broadcast our own
                // tally. Every finished particle is counted exactly once,
                // by the rank that held it when it died.
                self.finished_particles += self.messenger.take_finished_count();
                if self.delta > 0 {
                    self.messenger.send_count(self.delta);
                    self.delta = 0;
                }
            }

            self.ticks += 1;
            if self.ticks == DRAIN_INTERVAL {
                self.ticks = 0;
                self.drain_inbound();
            }
        }

        info!(
            "rank {}: global termination at {} particles, {} recorded here",
            self.region.rank,
            self.finished_particles,
            self.histogram.total()
        );
        let layout = SlabLayout::for_rank(&self.grid, self.region.rank);
        self.messenger.dump(self.histogram.counts().to_vec(), layout);
        self.messenger.shutdown();
        self.messenger.join()?;

        Ok(RankReport {
            rank: self.region.rank,
            finished_particles: self.finished_particles,
            recorded: self.histogram.total(),
            histogram: self.histogram,
        })
    }

    /// One sweep over the pool: step, classify, and dispose of every
    /// resident particle. Removal resumes from the predecessor, so the
    /// sweep stays a single pass whatever gets unlinked.
    fn step_residents(&mut self) {
        let grid = self.grid;
        let region = self.region;
        let probs = self.config.step_probabilities();
        let max_iterations = self.config.max_iterations;
        let rng = &mut self.rng;
        let histogram = &mut self.histogram;
        let delta = &mut self.delta;
        let messenger = &self.messenger;

        let mut cursor = self.pool.cursor();
        while let Some(particle) = cursor.current_mut() {
            particle.step(probs, rng);
            let target = route(particle, &region, &grid, max_iterations);
            let iterations = particle.iterations;

            if target != region.rank {
                let migrant = cursor.remove();
                let dest = grid.region_of(target);
                assert!(
                    migrant.x >= dest.min_x && migrant.x <= dest.min_x + grid.bound,
                    "rank {}: migrant x {} misses target rank {} (region starts at {}), iterations {}",
                    region.rank,
                    migrant.x,
                    target,
                    dest.min_x,
                    migrant.iterations
                );
                assert!(
                    migrant.y >= dest.min_y && migrant.y <= dest.min_y + grid.bound,
                    "rank {}: migrant y {} misses target rank {} (region starts at {}), iterations {}",
                    region.rank,
                    migrant.y,
                    target,
                    dest.min_y,
                    migrant.iterations
                );
                trace!(
                    "rank {}: particle ({}, {}) handed to rank {}",
                    region.rank,
                    migrant.x,
                    migrant.y,
                    target
                );
                messenger.send_particle(migrant, target);
            } else if iterations == max_iterations {
                let finished = cursor.remove();
                histogram.record(
                    finished.x - region.min_x,
                    finished.y - region.min_y,
                    finished.origin,
                );
                *delta += 1;
            } else {
                cursor.advance();
            }
        }
    }

    /// Claims everything the messenger has received. A particle that ran
    /// out of budget in transit finishes at its delivered position, which
    /// is local by construction of the routing.
    fn drain_inbound(&mut self) {
        let pending = self.messenger.inbound_len();
        if pending > 0 {
            debug!(
                "rank {}: claiming {} delivered particles ({} resident)",
                self.region.rank,
                pending,
                self.pool.len()
            );
        }
        while let Some(particle) = self.messenger.pop_particle() {
            if particle.iterations == self.config.max_iterations {
                self.histogram.record(
                    particle.x - self.region.min_x,
                    particle.y - self.region.min_y,
                    particle.origin,
                );
                self.delta += 1;
            } else {
                self.pool.push_front(particle);
            }
        }
    }
}

/// Decides which rank owns a particle after its step.
///
/// Combined wrap-then-divide policy: if the particle has drifted past the
/// grace margin on any side, or its budget is spent, wrap the position
/// toroidally and divide by the region side to find the owner. A particle
/// whose budget runs out inside its own region resolves to the resident
/// rank and finishes in place; outside, it routes to wherever it now is.
fn route(particle: &mut Particle, region: &Region, grid: &RankGrid, max_iterations: u64) -> usize {
    let beyond_grace = particle.x > region.max_x + region.grace
        || particle.x < region.min_x - region.grace
        || particle.y > region.max_y + region.grace
        || particle.y < region.min_y - region.grace;
    if !beyond_grace && particle.iterations != max_iterations {
        return region.rank;
    }
    grid.wrap(&mut particle.x, &mut particle.y);
    grid.rank_at(particle.x, particle.y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::LocalCluster;
    use std::fs;
    use std::path::PathBuf;
    use std::thread;
    use walker_common::StepProbabilities;
    use zerocopy::IntoBytes;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("walker-sim-{}-{}.bin", tag, std::process::id()))
    }

    fn scenario(
        bound: u32,
        width: u32,
        height: u32,
        max_iterations: u64,
        start_particles: u64,
        probs: [f64; 4],
        tag: &str,
    ) -> SimConfig {
        SimConfig {
            bound,
            width,
            height,
            max_iterations,
            start_particles,
            p_left: probs[0],
            p_right: probs[1],
            p_up: probs[2],
            p_down: probs[3],
            seed: 2024,
            output: temp_path(tag),
        }
    }

    fn run_cluster(config: &SimConfig) -> Vec<RankReport> {
        let endpoints = LocalCluster::new(config.rank_count(), &config.output);
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let config = config.clone();
                thread::spawn(move || Simulation::new(endpoint, config).unwrap().run().unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn single_rank_scenario_terminates_exactly() {
        let config = scenario(10, 1, 1, 5, 3, [0.25, 0.25, 0.25, 0.25], "single");
        let reports = run_cluster(&config);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].finished_particles, 3);
        assert_eq!(reports[0].recorded, 3);
        assert_eq!(reports[0].histogram.total(), 3);
        let _ = fs::remove_file(&config.output);
    }

    #[test]
    fn rightward_walker_at_the_edge_routes_to_the_neighbor() {
        let grid = RankGrid::new(10, 2, 1);
        let region = grid.region_of(0);
        let probs = StepProbabilities {
            left: 0.0,
            right: 1.0,
            up: 0.0,
            down: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(9);
        let mut particle = Particle {
            x: region.max_x,
            y: 5,
            origin: 0,
            iterations: 0,
        };
        let mut ticks = 0i32;
        let target = loop {
            particle.step(probs, &mut rng);
            ticks += 1;
            let target = route(&mut particle, &region, &grid, 1_000);
            if target != region.rank {
                break target;
            }
            assert!(ticks <= region.grace + 2, "walker never migrated");
        };
        assert_eq!(target, 1);
        assert!(ticks <= region.grace + 2);
        // Post-wrap position lies inside rank 1's region, with the
        // routing's inclusive upper tolerance.
        let dest = grid.region_of(1);
        assert!(particle.x >= dest.min_x && particle.x <= dest.min_x + grid.bound);
    }

    #[test]
    fn budget_spent_outside_the_region_routes_to_the_owner() {
        let grid = RankGrid::new(10, 2, 1);
        let region = grid.region_of(0);
        let probs = StepProbabilities {
            left: 0.0,
            right: 1.0,
            up: 0.0,
            down: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(4);
        // Next step lands at x = 10: inside the grace margin, but the
        // budget expires there, so the particle must route to rank 1.
        let mut particle = Particle {
            x: 9,
            y: 3,
            origin: 0,
            iterations: 4,
        };
        particle.step(probs, &mut rng);
        assert_eq!(particle.x, 10);
        let target = route(&mut particle, &region, &grid, 5);
        assert_eq!(target, 1);
    }

    #[test]
    fn wrap_keeps_a_single_rank_domain_resident() {
        let grid = RankGrid::new(10, 1, 1);
        let region = grid.region_of(0);
        let mut particle = Particle {
            x: -2,
            y: 5,
            origin: 0,
            iterations: 3,
        };
        let target = route(&mut particle, &region, &grid, 100);
        assert_eq!(target, 0);
        assert_eq!(particle.x, 8);
    }

    #[test]
    fn two_rank_run_conserves_particles_and_origins() {
        // Deterministic rightward march: every particle crosses the rank
        // boundary at least once before its budget runs out.
        let config = scenario(10, 2, 1, 15, 4, [0.0, 1.0, 0.0, 0.0], "tworank");
        let reports = run_cluster(&config);
        let total: u64 = reports.iter().map(|r| r.recorded).sum();
        assert_eq!(total, config.total_particles());
        for report in &reports {
            assert_eq!(report.finished_particles, config.total_particles());
        }
        // Origin attribution survives migration: each rank spawned four
        // particles, and each origin accounts for exactly four entries
        // across both histograms.
        let ranks = config.rank_count();
        let mut by_origin = vec![0u64; ranks];
        for report in &reports {
            for (index, count) in report.histogram.counts().iter().enumerate() {
                by_origin[index % ranks] += count;
            }
        }
        assert_eq!(by_origin, vec![4, 4]);
        let _ = fs::remove_file(&config.output);
    }

    #[test]
    fn dump_file_round_trips_through_the_slab_layout() {
        let config = scenario(4, 2, 2, 10, 5, [0.25, 0.25, 0.25, 0.25], "dump22");
        let _ = fs::remove_file(&config.output);
        let reports = run_cluster(&config);

        let grid = config.grid();
        let bytes = fs::read(&config.output).unwrap();
        assert_eq!(
            bytes.len() as u64,
            SlabLayout::nominal_file_len(&grid) * SlabLayout::ELEM_BYTES
        );
        let mut elems = vec![0u64; bytes.len() / 8];
        elems.as_mut_bytes().copy_from_slice(&bytes);
        assert_eq!(elems.iter().sum::<u64>(), config.total_particles());

        // Each rank's slab gathers back to exactly its histogram.
        for report in &reports {
            let layout = SlabLayout::for_rank(&grid, report.rank);
            let mut gathered = Vec::with_capacity(layout.slab_len() as usize);
            for k in 0..layout.block_count {
                let start = layout.block_offset(k) as usize;
                gathered.extend_from_slice(&elems[start..start + layout.block_len as usize]);
            }
            assert_eq!(gathered, report.histogram.counts());
        }
        let _ = fs::remove_file(&config.output);
    }
}
