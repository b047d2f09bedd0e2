use crate::arena::{Arena, DEFAULT_RADIUS_RATIO};
use crate::body::BodyId;
use crate::collision::CollisionResolver;
use crate::error::{Error, Result};
use crate::event_log::{EventLogger, DEFAULT_CAPACITY};
use crate::registry::BodyRegistry;
use crate::scheduler::{RefreshPolicy, Scheduler, Scheduling};
use crate::world_gen::SpawnConfig;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const FRAME_TIME_MS: u64 = 16;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// JSON-lines event file; `None` discards events.
    pub path: Option<PathBuf>,
    pub capacity: usize,
    pub shutdown_timeout_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            path: None,
            capacity: DEFAULT_CAPACITY,
            shutdown_timeout_ms: 2000,
        }
    }
}

impl LogConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Everything tunable about a run. Loadable from YAML; missing keys take defaults.
///
/// ```yaml
/// arena_size: 400.0
/// frame_interval_ms: 16
/// refresh:
///   adaptive: { min_interval_ms: 4, max_interval_ms: 32, distance_per_tick: 2.0 }
/// scheduling:
///   pooled: { workers: 4 }
/// log:
///   path: logs/balls_logs.json
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub arena_size: f64,
    pub radius_ratio: f64,
    /// Velocities are in units per frame of this length.
    pub frame_interval_ms: u64,
    /// Upper bound on frames covered by one tick, so a stalled body does not jump.
    pub max_step_scale: f64,
    pub refresh: RefreshPolicy,
    pub scheduling: Scheduling,
    pub restitution: f64,
    pub clamp_energy: bool,
    pub spawn: SpawnConfig,
    pub log: LogConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            arena_size: 400.,
            radius_ratio: DEFAULT_RADIUS_RATIO,
            frame_interval_ms: FRAME_TIME_MS,
            max_step_scale: 4.,
            refresh: RefreshPolicy::default(),
            scheduling: Scheduling::default(),
            restitution: 1.,
            clamp_energy: true,
            spawn: SpawnConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Defaults with caller-driven ticks.
    pub fn manual() -> SimulationConfig {
        SimulationConfig {
            scheduling: Scheduling::Manual,
            ..SimulationConfig::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<SimulationConfig> {
        let config: SimulationConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<SimulationConfig> {
        let reader = BufReader::new(File::open(path)?);
        let config: SimulationConfig = serde_yaml::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.arena_size.is_finite() || self.arena_size <= 0. {
            return Err(invalid(format!("arena_size must be positive, got {}", self.arena_size)));
        }
        if self.frame_interval_ms == 0 {
            return Err(invalid("frame_interval_ms must be at least 1".to_string()));
        }
        if !self.max_step_scale.is_finite() || self.max_step_scale <= 0. {
            return Err(invalid(format!(
                "max_step_scale must be positive, got {}",
                self.max_step_scale
            )));
        }
        if !(0. ..=1.).contains(&self.restitution) {
            return Err(invalid(format!(
                "restitution must be within [0, 1], got {}",
                self.restitution
            )));
        }
        if let RefreshPolicy::Adaptive {
            min_interval_ms,
            max_interval_ms,
            distance_per_tick,
        } = self.refresh
        {
            if min_interval_ms == 0 || max_interval_ms < min_interval_ms {
                return Err(invalid(
                    "adaptive refresh needs 0 < min_interval_ms <= max_interval_ms".to_string(),
                ));
            }
            if !distance_per_tick.is_finite() || distance_per_tick <= 0. {
                return Err(invalid("distance_per_tick must be positive".to_string()));
            }
        }
        if self.log.capacity == 0 {
            return Err(invalid("log.capacity must be at least 1".to_string()));
        }
        self.spawn.validate()
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    /// Frames of motion covered by a tick that came `elapsed` after the previous one.
    pub fn step_scale(&self, elapsed: Duration) -> f64 {
        let frames = elapsed.as_secs_f64() / self.frame_interval().as_secs_f64();
        frames.min(self.max_frames_per_tick())
    }

    /// Cap on `step_scale`. Never below the longest interval the refresh
    /// policy can schedule, so a slow body is credited its whole wait.
    pub fn max_frames_per_tick(&self) -> f64 {
        match self.refresh {
            RefreshPolicy::Fixed => self.max_step_scale,
            RefreshPolicy::Adaptive {
                min_interval_ms,
                max_interval_ms,
                ..
            } => {
                let longest = max_interval_ms.max(min_interval_ms) as f64;
                self.max_step_scale
                    .max(longest / self.frame_interval_ms as f64)
            }
        }
    }
}

fn invalid(message: String) -> Error {
    Error::InvalidArgument(message)
}

/// State shared by every body of one simulation.
///
/// Bodies get an `Arc` to it at construction instead of reaching for
/// globals. The owner creates the logger and scheduler exactly once here and
/// shuts them down exactly once through [`SimulationContext::shutdown`].
pub struct SimulationContext {
    pub config: SimulationConfig,
    pub arena: Arena,
    pub registry: BodyRegistry,
    pub resolver: CollisionResolver,
    pub logger: EventLogger,
    pub scheduler: Scheduler,
    next_body_id: AtomicU64,
}

impl SimulationContext {
    pub fn new(config: SimulationConfig) -> Result<Arc<SimulationContext>> {
        config.validate()?;
        let arena = Arena::square(config.arena_size, config.radius_ratio)?;
        let logger = match &config.log.path {
            Some(path) => EventLogger::open(path, config.log.capacity)?,
            None => EventLogger::discard(config.log.capacity)?,
        };
        let scheduler = Scheduler::new(config.scheduling)?;
        info!(
            "simulation context ready: arena {}x{}, radius {}, {:?}",
            config.arena_size,
            config.arena_size,
            arena.radius(),
            config.scheduling
        );
        Ok(Arc::new(SimulationContext {
            resolver: CollisionResolver::new(config.restitution, config.clamp_energy),
            config,
            arena,
            registry: BodyRegistry::new(),
            logger,
            scheduler,
            next_body_id: AtomicU64::new(1),
        }))
    }

    pub(crate) fn next_body_id(&self) -> BodyId {
        BodyId::new(self.next_body_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Stops scheduling and drains the event log. Bodies should be stopped first.
    ///
    /// Returns whether the log drained within the configured timeout.
    pub fn shutdown(&self) -> bool {
        for body in self.registry.clear() {
            body.stop();
        }
        self.scheduler.shutdown();
        self.logger.shutdown(self.config.log.shutdown_timeout())
    }
}
