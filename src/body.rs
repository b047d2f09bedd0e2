use crate::collision::Resolution;
use crate::error::{Error, Result};
use crate::event_log::{EventKind, LogEvent};
use crate::scheduler::{Schedulable, TaskId};
use crate::simulation::SimulationContext;
use crate::sync;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, trace};
use nalgebra::Vector2;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyId(u64);

impl BodyId {
    pub fn new(raw: u64) -> BodyId {
        BodyId(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "body#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Motion {
    pub position: Vector2<f64>,
    /// Units per frame.
    pub velocity: Vector2<f64>,
}

/// Receives a body's committed position after every tick until it stops.
pub type PositionFeed = Receiver<Vector2<f64>>;

/// Positions a feed buffers for a slow reader. Newer updates are dropped
/// while it is full.
pub const FEED_CAPACITY: usize = 256;

/// One moving body. Ticked by the shared scheduler until [`Body::stop`].
pub struct Body {
    id: BodyId,
    motion: Mutex<Motion>,
    running: AtomicBool,
    // Held for a whole tick; `stop` takes it to wait out a tick in flight.
    tick_guard: Mutex<()>,
    subscribers: Mutex<Vec<Sender<Vector2<f64>>>>,
    context: Arc<SimulationContext>,
}

fn is_finite(v: &Vector2<f64>) -> bool {
    v.x.is_finite() && v.y.is_finite()
}

impl Body {
    /// Registers a new body and schedules its first tick.
    pub fn new(
        context: &Arc<SimulationContext>,
        position: Vector2<f64>,
        velocity: Vector2<f64>,
    ) -> Result<Arc<Body>> {
        if !is_finite(&position) || !is_finite(&velocity) {
            return Err(Error::InvalidArgument(format!(
                "body needs finite position and velocity, got {position:?} {velocity:?}"
            )));
        }
        let body = Arc::new(Body {
            id: context.next_body_id(),
            motion: Mutex::new(Motion { position, velocity }),
            running: AtomicBool::new(true),
            tick_guard: Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
            context: context.clone(),
        });

        context.registry.add(body.clone());
        if let Err(e) = context.scheduler.schedule(body.task_id(), body.clone()) {
            body.running.store(false, Ordering::Release);
            context.registry.remove(body.id);
            return Err(e);
        }
        debug!(
            "{} created at ({:.1}, {:.1})",
            body.id, position.x, position.y
        );
        context
            .logger
            .log(LogEvent::new(EventKind::BodyCreated, position, velocity));
        Ok(body)
    }

    pub fn id(&self) -> BodyId {
        self.id
    }

    fn task_id(&self) -> TaskId {
        TaskId(self.id.get())
    }

    pub fn position(&self) -> Vector2<f64> {
        sync::lock(&self.motion).position
    }

    pub fn velocity(&self) -> Vector2<f64> {
        sync::lock(&self.motion).velocity
    }

    /// Position and velocity read together.
    pub fn motion(&self) -> Motion {
        *sync::lock(&self.motion)
    }

    pub fn radius(&self) -> f64 {
        self.context.arena.radius()
    }

    pub fn set_velocity(&self, velocity: Vector2<f64>) -> Result<()> {
        if !is_finite(&velocity) {
            return Err(Error::InvalidArgument(format!(
                "velocity must be finite, got {velocity:?}"
            )));
        }
        sync::lock(&self.motion).velocity = velocity;
        self.context.scheduler.reschedule(self.task_id());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// New position feed holding at most [`FEED_CAPACITY`] unread positions.
    /// Disconnected right away if the body already stopped.
    pub fn subscribe(&self) -> PositionFeed {
        let (tx, rx) = bounded(FEED_CAPACITY);
        let mut subscribers = sync::lock(&self.subscribers);
        if self.is_running() {
            subscribers.push(tx);
        }
        rx
    }

    pub(crate) fn lock_motion(&self) -> MutexGuard<'_, Motion> {
        sync::lock(&self.motion)
    }

    /// One movement step covering `elapsed`.
    ///
    /// Locks the registry, then this body, then each neighbour in turn.
    /// Subscribers and the event log are only touched after all of those
    /// locks are released.
    fn advance(&self, elapsed: Duration) {
        let _tick = sync::lock(&self.tick_guard);
        if !self.is_running() {
            return;
        }
        let context = &self.context;
        let scale = context.config.step_scale(elapsed);
        let arena = context.arena.geometry();

        let (committed, resolution) = {
            let scan = context.registry.lock();
            let mut motion = sync::lock(&self.motion);
            let candidate = motion.position + motion.velocity * scale;
            let resolution =
                context
                    .resolver
                    .resolve(self.id, candidate, &mut motion.velocity, &arena, &scan);
            motion.position = resolution.position;
            (*motion, resolution)
        };

        self.publish(committed.position);
        self.report(&committed, &resolution);
    }

    fn publish(&self, position: Vector2<f64>) {
        sync::lock(&self.subscribers).retain(|tx| match tx.try_send(position) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn report(&self, committed: &Motion, resolution: &Resolution) {
        let logger = &self.context.logger;
        for border in &resolution.borders {
            trace!("{} hit the {:?} border", self.id, border);
            logger.log(LogEvent::new(
                border.event_kind(),
                committed.position,
                committed.velocity,
            ));
        }
        for contact in &resolution.contacts {
            trace!("{} collided with {}", self.id, contact.other);
            logger.log(LogEvent::new(
                EventKind::BodyCollision,
                committed.position,
                committed.velocity,
            ));
        }
    }

    /// Stops ticking and leaves the registry. Idempotent.
    ///
    /// When this returns no tick of this body is running and no further
    /// position updates will be delivered.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.context.scheduler.cancel(self.task_id());
        let _quiesced = sync::lock(&self.tick_guard);
        self.context.registry.remove(self.id);
        sync::lock(&self.subscribers).clear();

        let motion = self.motion();
        debug!("{} stopped", self.id);
        self.context.logger.log(LogEvent::new(
            EventKind::BodyStopped,
            motion.position,
            motion.velocity,
        ));
    }
}

impl Schedulable for Body {
    fn tick(&self, elapsed: Duration) {
        self.advance(elapsed);
    }

    fn next_interval(&self) -> Duration {
        let config = &self.context.config;
        config
            .refresh
            .interval(config.frame_interval(), self.velocity().norm())
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("id", &self.id)
            .field("motion", &self.motion())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{RefreshPolicy, Scheduling};
    use crate::simulation::SimulationConfig;
    use approx::assert_abs_diff_eq;
    use crossbeam_channel::TryRecvError;
    use std::thread;

    const FRAME: Duration = Duration::from_millis(16);

    fn manual_context() -> Arc<SimulationContext> {
        SimulationContext::new(SimulationConfig::manual()).unwrap()
    }

    #[test]
    fn moves_by_velocity_each_frame() {
        let context = manual_context();
        let body = Body::new(&context, Vector2::new(100., 100.), Vector2::new(2., 1.)).unwrap();
        let feed = body.subscribe();

        context.scheduler.run_round(FRAME).unwrap();
        assert_eq!(body.position(), Vector2::new(102., 101.));
        assert_eq!(feed.try_recv(), Ok(Vector2::new(102., 101.)));

        context.scheduler.run_round(FRAME / 2).unwrap();
        assert_abs_diff_eq!(body.position().x, 103., epsilon = 1e-9);
        body.stop();
    }

    #[test]
    fn bounces_off_left_border() {
        let context = manual_context();
        let body = Body::new(&context, Vector2::new(12., 200.), Vector2::new(-5., 0.)).unwrap();
        context.scheduler.run_round(FRAME).unwrap();
        let motion = body.motion();
        assert_abs_diff_eq!(motion.position.x, 10., epsilon = 1e-9);
        assert_eq!(motion.velocity, Vector2::new(5., 0.));
        body.stop();
    }

    #[test]
    fn head_on_bodies_exchange_velocities() {
        let context = manual_context();
        let a = Body::new(&context, Vector2::new(100., 100.), Vector2::new(5., 0.)).unwrap();
        let b = Body::new(&context, Vector2::new(125., 100.), Vector2::new(-5., 0.)).unwrap();

        // `a` ticks first and ends exactly touching; `b` then overlaps and resolves.
        context.scheduler.run_round(FRAME).unwrap();
        assert_abs_diff_eq!(a.velocity().x, -5., epsilon = 1e-9);
        assert_abs_diff_eq!(b.velocity().x, 5., epsilon = 1e-9);
        assert_abs_diff_eq!((a.velocity() + b.velocity()).norm(), 0., epsilon = 1e-9);
        assert_abs_diff_eq!(b.position().x, 122.5, epsilon = 1e-9);
        a.stop();
        b.stop();
    }

    #[test]
    fn unread_feed_stays_bounded() {
        let context = manual_context();
        let body = Body::new(&context, Vector2::new(100., 100.), Vector2::new(1.5, 0.7)).unwrap();
        let feed = body.subscribe();
        for _ in 0..5000 {
            context.scheduler.run_round(FRAME).unwrap();
        }
        assert_eq!(feed.len(), FEED_CAPACITY);
        assert_eq!(sync::lock(&body.subscribers).len(), 1);

        drop(feed);
        context.scheduler.run_round(FRAME).unwrap();
        assert!(sync::lock(&body.subscribers).is_empty());
        body.stop();
    }

    fn slow_adaptive(scheduling: Scheduling) -> SimulationConfig {
        SimulationConfig {
            refresh: RefreshPolicy::Adaptive {
                min_interval_ms: 4,
                max_interval_ms: 200,
                distance_per_tick: 2.,
            },
            scheduling,
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn slow_adaptive_body_is_credited_its_whole_interval() {
        let context = SimulationContext::new(slow_adaptive(Scheduling::Manual)).unwrap();
        let body = Body::new(&context, Vector2::new(100., 200.), Vector2::new(0.1, 0.)).unwrap();
        assert_eq!(body.next_interval(), Duration::from_millis(200));

        context.scheduler.run_round(Duration::from_millis(200)).unwrap();
        // 200 ms is 12.5 frames of 16 ms.
        assert_abs_diff_eq!(body.position().x, 101.25, epsilon = 1e-9);
        body.stop();
    }

    #[test]
    fn pooled_adaptive_body_keeps_its_speed() {
        let context =
            SimulationContext::new(slow_adaptive(Scheduling::Pooled { workers: 2 })).unwrap();
        let started = std::time::Instant::now();
        let body = Body::new(&context, Vector2::new(100., 200.), Vector2::new(0.1, 0.)).unwrap();
        thread::sleep(Duration::from_millis(1650));
        body.stop();
        let elapsed = started.elapsed().as_secs_f64();

        let moved = body.position().x - 100.;
        let expected = 0.1 * elapsed / 0.016;
        // At most one 200 ms interval may still be pending when the body stops.
        let pending = 0.1 * 0.2 / 0.016;
        assert!(moved <= expected + 1e-6, "moved {moved}, expected about {expected}");
        assert!(moved >= 0.8 * (expected - pending), "moved {moved}, expected about {expected}");
        assert!(context.shutdown());
    }

    #[test]
    fn set_velocity_rejects_non_finite() {
        let context = manual_context();
        let body = Body::new(&context, Vector2::new(50., 50.), Vector2::zeros()).unwrap();
        body.set_velocity(Vector2::new(1., -1.)).unwrap();
        assert_eq!(body.velocity(), Vector2::new(1., -1.));
        assert!(matches!(
            body.set_velocity(Vector2::new(f64::NAN, 0.)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(Body::new(&context, Vector2::new(f64::INFINITY, 0.), Vector2::zeros()).is_err());
        body.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let context = manual_context();
        let body = Body::new(&context, Vector2::new(50., 50.), Vector2::new(1., 0.)).unwrap();
        body.stop();
        body.stop();
        assert!(!body.is_running());
        assert!(context.scheduler.is_empty());
        assert!(context.registry.is_empty());

        let before = body.position();
        context.scheduler.run_round(FRAME).unwrap();
        assert_eq!(body.position(), before);
        assert_eq!(body.subscribe().try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn no_updates_after_stop_returns() {
        let config = SimulationConfig {
            frame_interval_ms: 1,
            scheduling: Scheduling::Pooled { workers: 2 },
            ..SimulationConfig::default()
        };
        let context = SimulationContext::new(config).unwrap();
        let body = Body::new(&context, Vector2::new(200., 200.), Vector2::new(0.5, 0.3)).unwrap();
        let feed = body.subscribe();
        thread::sleep(Duration::from_millis(50));
        body.stop();

        let delivered = feed.len();
        assert!(delivered > 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(feed.len(), delivered);
        assert_eq!(feed.try_iter().count(), delivered);
        assert_eq!(feed.try_recv(), Err(TryRecvError::Disconnected));
        assert!(context.shutdown());
    }
}
