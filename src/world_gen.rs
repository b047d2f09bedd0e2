use crate::arena::ArenaGeometry;
use crate::error::{Error, Result};
use nalgebra::Vector2;
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpeedTier {
    /// Speed in units per frame.
    pub multiplier: f64,
    pub weight: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Distance kept between the arena edge and spawned centers.
    pub margin: f64,
    pub speed_tiers: Vec<SpeedTier>,
    /// Fixed seed for reproducible runs.
    pub seed: Option<u64>,
    /// Placement retries before accepting an overlapping spot.
    pub max_attempts: usize,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        SpawnConfig {
            margin: 50.,
            speed_tiers: vec![
                SpeedTier {
                    multiplier: 2.0,
                    weight: 0.30,
                },
                SpeedTier {
                    multiplier: 1.8,
                    weight: 0.35,
                },
                SpeedTier {
                    multiplier: 1.5,
                    weight: 0.35,
                },
            ],
            seed: None,
            max_attempts: 64,
        }
    }
}

impl SpawnConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.margin.is_finite() || self.margin < 0. {
            return Err(Error::InvalidArgument(format!(
                "spawn margin must be non-negative, got {}",
                self.margin
            )));
        }
        if self
            .speed_tiers
            .iter()
            .any(|tier| !tier.multiplier.is_finite() || tier.multiplier < 0.)
        {
            return Err(Error::InvalidArgument(
                "speed multipliers must be non-negative".to_string(),
            ));
        }
        WeightedIndex::new(self.speed_tiers.iter().map(|tier| tier.weight))
            .map(|_| ())
            .map_err(|e| Error::InvalidArgument(format!("bad speed tier weights: {e}")))
    }
}

/// Random initial conditions: position inside the margins, speed from the
/// weighted tiers, direction uniform over a full turn.
pub struct Spawner {
    rng: Pcg64,
    tiers: WeightedIndex<f64>,
    multipliers: Vec<f64>,
    margin: f64,
    max_attempts: usize,
}

impl Spawner {
    pub fn new(config: &SpawnConfig) -> Result<Spawner> {
        config.validate()?;
        let tiers = WeightedIndex::new(config.speed_tiers.iter().map(|tier| tier.weight))
            .map_err(|e| Error::InvalidArgument(format!("bad speed tier weights: {e}")))?;
        let rng = match config.seed {
            Some(seed) => Pcg64::seed_from_u64(seed),
            None => Pcg64::from_entropy(),
        };
        Ok(Spawner {
            rng,
            tiers,
            multipliers: config.speed_tiers.iter().map(|tier| tier.multiplier).collect(),
            margin: config.margin,
            max_attempts: config.max_attempts.max(1),
        })
    }

    /// Picks `(position, velocity)` for a new body, avoiding the centers in `taken`.
    pub fn spawn(&mut self, arena: &ArenaGeometry, taken: &[Vector2<f64>]) -> (Vector2<f64>, Vector2<f64>) {
        let mut position = self.random_position(arena);
        for _ in 1..self.max_attempts {
            // Check it doesn't overlap with an existing body.
            let overlaps = taken
                .iter()
                .any(|other| (other - position).norm() <= arena.collision_distance());
            if !overlaps {
                break;
            }
            position = self.random_position(arena);
        }

        let angle = self.rng.gen_range(0.0..std::f64::consts::TAU);
        let speed = self.multipliers[self.tiers.sample(&mut self.rng)];
        (position, Vector2::new(speed * angle.cos(), speed * angle.sin()))
    }

    fn random_position(&mut self, arena: &ArenaGeometry) -> Vector2<f64> {
        Vector2::new(
            self.random_coordinate(arena.width, arena.radius),
            self.random_coordinate(arena.height, arena.radius),
        )
    }

    fn random_coordinate(&mut self, extent: f64, radius: f64) -> f64 {
        let mut inset = self.margin.max(radius);
        if 2. * inset >= extent {
            inset = radius;
        }
        let (low, high) = (inset, extent - inset);
        if low >= high {
            extent / 2.
        } else {
            self.rng.gen_range(low..high)
        }
    }
}
