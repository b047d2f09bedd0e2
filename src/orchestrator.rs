use crate::arena::ArenaGeometry;
use crate::body::Body;
use crate::error::{Error, Result};
use crate::event_log::EventLogger;
use crate::simulation::{SimulationConfig, SimulationContext};
use crate::sync;
use crate::world_gen::Spawner;
use log::{info, warn};
use nalgebra::Vector2;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct Population {
    bodies: Vec<Arc<Body>>,
    spawner: Spawner,
}

/// Owns one simulation: spawns bodies, tracks them, and tears everything down.
///
/// Every operation fails with [`Error::Disposed`] once [`Orchestrator::shutdown`]
/// has run, including a second `shutdown`.
pub struct Orchestrator {
    context: Arc<SimulationContext>,
    population: Mutex<Population>,
    disposed: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: SimulationConfig) -> Result<Orchestrator> {
        let spawner = Spawner::new(&config.spawn)?;
        let context = SimulationContext::new(config)?;
        Ok(Orchestrator {
            context,
            population: Mutex::new(Population {
                bodies: Vec::new(),
                spawner,
            }),
            disposed: AtomicBool::new(false),
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    /// Spawns `count` bodies at random non-overlapping spots and starts them.
    ///
    /// `on_created` runs once per body with its initial position, after all
    /// of them have been registered.
    pub fn start<F>(&self, count: usize, mut on_created: F) -> Result<()>
    where
        F: FnMut(Vector2<f64>, Arc<Body>),
    {
        if count == 0 {
            return Err(Error::InvalidArgument(
                "body count must be at least 1".to_string(),
            ));
        }
        let created = {
            let mut population = sync::lock(&self.population);
            // Checked under the lock so a concurrent shutdown cannot miss these bodies.
            self.ensure_live()?;
            let arena = self.context.arena.geometry();
            let mut taken: Vec<Vector2<f64>> =
                population.bodies.iter().map(|body| body.position()).collect();
            let mut created = Vec::with_capacity(count);
            for _ in 0..count {
                let (position, velocity) = population.spawner.spawn(&arena, &taken);
                let body = Body::new(&self.context, position, velocity)?;
                taken.push(position);
                population.bodies.push(body.clone());
                created.push((position, body));
            }
            created
        };
        let arena = self.context.arena.geometry();
        info!(
            "started {} bodies in a {}x{} arena",
            created.len(),
            arena.width,
            arena.height
        );
        for (position, body) in created {
            on_created(position, body);
        }
        Ok(())
    }

    /// Resizes to a `size`x`size` arena; the radius follows.
    pub fn update_arena_size(&self, size: f64) -> Result<()> {
        self.update_arena_dimensions(size, size)
    }

    pub fn update_arena_dimensions(&self, width: f64, height: f64) -> Result<()> {
        self.ensure_live()?;
        let geometry = self.context.arena.resize_to(width, height)?;
        info!(
            "arena resized to {}x{}, radius {}",
            geometry.width, geometry.height, geometry.radius
        );
        Ok(())
    }

    /// Ticks every body once, one frame apart. Manual scheduling only.
    pub fn step(&self) -> Result<()> {
        self.ensure_live()?;
        self.context
            .scheduler
            .run_round(self.context.config.frame_interval())
    }

    pub fn bodies(&self) -> Vec<Arc<Body>> {
        sync::lock(&self.population).bodies.clone()
    }

    pub fn arena(&self) -> ArenaGeometry {
        self.context.arena.geometry()
    }

    pub fn logger(&self) -> &EventLogger {
        &self.context.logger
    }

    pub fn context(&self) -> &Arc<SimulationContext> {
        &self.context
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stops every body, then the scheduler, then drains the event log.
    pub fn shutdown(&self) -> Result<()> {
        let bodies = {
            let mut population = sync::lock(&self.population);
            if self.disposed.swap(true, Ordering::AcqRel) {
                return Err(Error::Disposed);
            }
            std::mem::take(&mut population.bodies)
        };
        for body in &bodies {
            body.stop();
        }
        let drained = self.context.shutdown();
        if drained {
            info!("simulation shut down, {} bodies stopped", bodies.len());
        } else {
            warn!(
                "simulation shut down, {} bodies stopped, event log did not drain in time",
                bodies.len()
            );
        }
        Ok(())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if !self.is_disposed() {
            let _ = self.shutdown();
        }
    }
}
