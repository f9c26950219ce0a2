use crate::layout::RankGrid;
use anyhow::Result;
use std::path::PathBuf;

/// The four per-step direction probabilities.
///
/// The step draw tests cumulative sums (`left`, `left+right`,
/// `left+right+up`) and sends everything else down, so any probability
/// mass missing from a sum below 1.0 lands in the `down` branch. That is
/// deliberate and must not be normalized away.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepProbabilities {
    pub left: f64,
    pub right: f64,
    pub up: f64,
    pub down: f64,
}

/// Run parameters for one simulation, assembled from the command line.
///
/// The nine mandatory values mirror the positional process arguments:
/// region side length, rank-grid width and height, the per-particle
/// iteration budget, the spawn count per rank, and the four step
/// probabilities.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Side length of each rank's square sub-region, in grid cells.
    pub bound: u32,
    /// Number of rank columns in the domain grid.
    pub width: u32,
    /// Number of rank rows in the domain grid.
    pub height: u32,
    /// Iteration budget: a particle finishes when it reaches this count.
    pub max_iterations: u64,
    /// Particles spawned by each rank at startup.
    pub start_particles: u64,
    pub p_left: f64,
    pub p_right: f64,
    pub p_up: f64,
    pub p_down: f64,
    /// Base RNG seed; each rank offsets this by its own rank id.
    pub seed: u64,
    /// Path of the shared binary histogram file.
    pub output: PathBuf,
}

impl SimConfig {
    /// Checks the parameters before any simulation state exists.
    /// A bad parameter set is a startup error, never a runtime condition.
    pub fn validate(&self) -> Result<()> {
        if self.bound == 0 {
            anyhow::bail!("bound must be positive");
        }
        if self.width == 0 || self.height == 0 {
            anyhow::bail!(
                "rank grid must be at least 1x1, got {}x{}",
                self.width,
                self.height
            );
        }
        if self.max_iterations == 0 {
            anyhow::bail!("max_iterations must be positive");
        }
        if self.start_particles == 0 {
            anyhow::bail!("start_particles must be positive");
        }
        // Particle coordinates are i32 on the wire; the whole domain has to fit.
        let domain_w = self.bound as u64 * self.width as u64;
        let domain_h = self.bound as u64 * self.height as u64;
        if domain_w > i32::MAX as u64 || domain_h > i32::MAX as u64 {
            anyhow::bail!(
                "domain {}x{} exceeds the coordinate range",
                domain_w,
                domain_h
            );
        }
        let probs = [
            ("p_l", self.p_left),
            ("p_r", self.p_right),
            ("p_u", self.p_up),
            ("p_d", self.p_down),
        ];
        for (name, p) in probs {
            if !p.is_finite() || !(0.0..=1.0).contains(&p) {
                anyhow::bail!("step probability {} must lie in [0, 1], got {}", name, p);
            }
        }
        let sum = self.p_left + self.p_right + self.p_up + self.p_down;
        if sum > 1.0 + 1e-9 {
            anyhow::bail!("step probabilities sum to {}, expected at most 1", sum);
        }
        Ok(())
    }

    /// The rank-grid decomposition these parameters describe.
    pub fn grid(&self) -> RankGrid {
        RankGrid::new(self.bound, self.width, self.height)
    }

    pub fn rank_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Global number of particles spawned across all ranks.
    pub fn total_particles(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.start_particles
    }

    pub fn step_probabilities(&self) -> StepProbabilities {
        StepProbabilities {
            left: self.p_left,
            right: self.p_right,
            up: self.p_up,
            down: self.p_down,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SimConfig {
        SimConfig {
            bound: 10,
            width: 2,
            height: 1,
            max_iterations: 5,
            start_particles: 3,
            p_left: 0.25,
            p_right: 0.25,
            p_up: 0.25,
            p_down: 0.25,
            seed: 42,
            output: PathBuf::from("data.bin"),
        }
    }

    #[test]
    fn accepts_a_typical_run() {
        let config = base_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.rank_count(), 2);
        assert_eq!(config.total_particles(), 6);
    }

    #[test]
    fn rejects_zero_bound() {
        let mut config = base_config();
        config.bound = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_probability_sum_above_one() {
        let mut config = base_config();
        config.p_left = 0.9;
        config.p_right = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_negative_probability() {
        let mut config = base_config();
        config.p_up = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_domain_beyond_coordinate_range() {
        let mut config = base_config();
        config.bound = u32::MAX;
        config.width = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn undershooting_probabilities_are_allowed() {
        // The residual mass silently feeds the down branch.
        let mut config = base_config();
        config.p_down = 0.0;
        assert!(config.validate().is_ok());
    }
}
