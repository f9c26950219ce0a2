use rand::prelude::*;
use serde::{Deserialize, Serialize};
use walker_common::{Region, StepProbabilities};

/// One random walker.
///
/// Coordinates are absolute grid cells and may sit transiently outside
/// the owning rank's region; `origin` is the rank that spawned the
/// particle and never changes. This is also the wire record exchanged
/// between ranks, so the field shapes are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Particle {
    pub x: i32,
    pub y: i32,
    pub origin: i32,
    pub iterations: u64,
}

impl Particle {
    /// Places a fresh particle uniformly inside `region`.
    pub fn spawn(region: &Region, origin: i32, rng: &mut impl Rng) -> Self {
        Self {
            x: region.min_x + rng.random_range(0..region.side()),
            y: region.min_y + rng.random_range(0..region.side()),
            origin,
            iterations: 0,
        }
    }

    /// One step of the walk: exactly one of the four moves happens.
    ///
    /// The draw is tested against running cumulative sums, so the
    /// probabilities are used as given. If they sum below 1.0 the
    /// residual mass falls into the final `y += 1` branch; that quirk is
    /// part of the walk's contract and is kept as-is.
    pub fn step(&mut self, probs: StepProbabilities, rng: &mut impl Rng) {
        self.iterations += 1;
        let draw: f64 = rng.random();
        let left = probs.left;
        let right = left + probs.right;
        let up = right + probs.up;
        if draw <= left {
            self.x -= 1;
        } else if draw <= right {
            self.x += 1;
        } else if draw <= up {
            self.y -= 1;
        } else {
            self.y += 1;
        }
    }
}
