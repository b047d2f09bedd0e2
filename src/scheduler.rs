//! Shared scheduler driving every body's update loop.
//!
//! In pooled mode a dispatcher thread keeps a priority queue of due instants
//! and hands due ticks to a rayon pool. A task is out of the queue while its
//! tick runs and goes back in afterwards, so one task never ticks twice at
//! once. Manual mode has no threads at all; the caller drives rounds.

use crate::error::{Error, Result};
use crate::sync;
use fnv::FnvHashMap;
use log::{debug, info};
use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Something the scheduler can tick periodically.
pub trait Schedulable: Send + Sync {
    /// Runs one update; `elapsed` is the time since the previous tick started.
    fn tick(&self, elapsed: Duration);

    /// Delay before the next tick, evaluated after each tick.
    fn next_interval(&self) -> Duration;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduling {
    /// `workers == 0` lets rayon pick the pool size.
    Pooled { workers: usize },
    Manual,
}

impl Default for Scheduling {
    fn default() -> Self {
        Scheduling::Pooled { workers: 0 }
    }
}

/// How long a body waits between ticks.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Every tick one frame apart.
    Fixed,
    /// Faster bodies tick more often so each tick covers about
    /// `distance_per_tick` units.
    Adaptive {
        min_interval_ms: u64,
        max_interval_ms: u64,
        distance_per_tick: f64,
    },
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        RefreshPolicy::Fixed
    }
}

impl RefreshPolicy {
    /// `speed` is in units per frame.
    pub fn interval(&self, frame: Duration, speed: f64) -> Duration {
        match *self {
            RefreshPolicy::Fixed => frame,
            RefreshPolicy::Adaptive {
                min_interval_ms,
                max_interval_ms,
                distance_per_tick,
            } => {
                let min = Duration::from_millis(min_interval_ms);
                let max = Duration::from_millis(max_interval_ms.max(min_interval_ms));
                if !speed.is_finite() || speed <= f64::EPSILON {
                    return max;
                }
                let frames = distance_per_tick / speed;
                if !frames.is_finite() || frames <= 0. {
                    return min;
                }
                let secs = frame.as_secs_f64() * frames;
                if secs >= max.as_secs_f64() {
                    max
                } else if secs <= min.as_secs_f64() {
                    min
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

struct Entry {
    task: Arc<dyn Schedulable>,
    last_run: Instant,
}

#[derive(Default)]
struct State {
    queue: PriorityQueue<TaskId, Reverse<Instant>>,
    tasks: FnvHashMap<TaskId, Entry>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

impl Shared {
    /// Puts a task that just finished ticking back into the queue.
    fn requeue(&self, id: TaskId) {
        let mut state = sync::lock(&self.state);
        if state.shutdown {
            return;
        }
        let due = match state.tasks.get(&id) {
            Some(entry) => entry.last_run + entry.task.next_interval(),
            None => return,
        };
        state.queue.push(id, Reverse(due));
        self.wakeup.notify_one();
    }
}

pub struct Scheduler {
    mode: Scheduling,
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(mode: Scheduling) -> Result<Scheduler> {
        let shared = Arc::new(Shared::default());
        let dispatcher = match mode {
            Scheduling::Manual => None,
            Scheduling::Pooled { workers } => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|i| format!("body-worker-{i}"))
                    .build()?;
                info!("scheduler started with {} workers", pool.current_num_threads());
                let shared = shared.clone();
                let handle = thread::Builder::new()
                    .name("body-dispatcher".to_string())
                    .spawn(move || dispatch(shared, pool))
                    .map_err(Error::Spawn)?;
                Some(handle)
            }
        };
        Ok(Scheduler {
            mode,
            shared,
            dispatcher: Mutex::new(dispatcher),
        })
    }

    pub fn mode(&self) -> Scheduling {
        self.mode
    }

    /// Registers `task`; its first tick is due one `next_interval()` from now.
    pub fn schedule(&self, id: TaskId, task: Arc<dyn Schedulable>) -> Result<()> {
        let mut state = sync::lock(&self.shared.state);
        if state.shutdown {
            return Err(Error::Disposed);
        }
        let now = Instant::now();
        let due = now + task.next_interval();
        state.tasks.insert(id, Entry { task, last_run: now });
        state.queue.push(id, Reverse(due));
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Forgets `id`. A tick already handed to the pool still runs to the end.
    pub fn cancel(&self, id: TaskId) -> bool {
        // The entry may own the last handle to its task; drop it unlocked.
        let removed = {
            let mut state = sync::lock(&self.shared.state);
            state.queue.remove(&id);
            state.tasks.remove(&id)
        };
        removed.is_some()
    }

    /// Recomputes the due instant of a waiting task, e.g. after its speed changed.
    ///
    /// A task that is currently ticking is not queued and picks up the new
    /// interval when it is requeued.
    pub fn reschedule(&self, id: TaskId) {
        let mut state = sync::lock(&self.shared.state);
        let due = match state.tasks.get(&id) {
            Some(entry) => entry.last_run + entry.task.next_interval(),
            None => return,
        };
        if state.queue.change_priority(&id, Reverse(due)).is_some() {
            self.shared.wakeup.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.shared.state).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ticks every task once, in id order, on the calling thread.
    pub fn run_round(&self, elapsed: Duration) -> Result<()> {
        if self.mode != Scheduling::Manual {
            return Err(Error::Unsupported(
                "manual rounds need Scheduling::Manual",
            ));
        }
        let mut due: Vec<(TaskId, Arc<dyn Schedulable>)> = {
            let mut state = sync::lock(&self.shared.state);
            if state.shutdown {
                return Err(Error::Disposed);
            }
            let now = Instant::now();
            state
                .tasks
                .iter_mut()
                .map(|(id, entry)| {
                    entry.last_run = now;
                    (*id, entry.task.clone())
                })
                .collect()
        };
        due.sort_by_key(|(id, _)| *id);
        for (_, task) in due {
            task.tick(elapsed);
        }
        Ok(())
    }

    /// Stops dispatching and joins the dispatcher. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let tasks = {
            let mut state = sync::lock(&self.shared.state);
            state.shutdown = true;
            state.queue.clear();
            self.shared.wakeup.notify_all();
            std::mem::take(&mut state.tasks)
        };
        drop(tasks);
        if let Some(handle) = sync::lock(&self.dispatcher).take() {
            if handle.join().is_err() {
                log::warn!("body dispatcher panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch(shared: Arc<Shared>, pool: rayon::ThreadPool) {
    let mut state = sync::lock(&shared.state);
    loop {
        if state.shutdown {
            break;
        }
        let now = Instant::now();
        let next_due = state.queue.peek().map(|(_, Reverse(due))| *due);
        match next_due {
            None => state = sync::wait(&shared.wakeup, state),
            Some(due) if due > now => state = sync::wait_timeout(&shared.wakeup, state, due - now),
            Some(_) => {
                let id = match state.queue.pop() {
                    Some((id, _)) => id,
                    None => continue,
                };
                let task = match state.tasks.get_mut(&id) {
                    Some(entry) => {
                        let elapsed = now.saturating_duration_since(entry.last_run);
                        entry.last_run = now;
                        Some((entry.task.clone(), elapsed))
                    }
                    None => None,
                };
                if let Some((task, elapsed)) = task {
                    let shared = shared.clone();
                    pool.spawn(move || {
                        task.tick(elapsed);
                        shared.requeue(id);
                    });
                }
            }
        }
    }
    debug!("body dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        ticks: AtomicUsize,
        running: AtomicUsize,
        overlapped: AtomicUsize,
        interval: Duration,
    }

    impl Counter {
        fn new(interval: Duration) -> Arc<Counter> {
            Arc::new(Counter {
                ticks: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                overlapped: AtomicUsize::new(0),
                interval,
            })
        }
    }

    impl Schedulable for Counter {
        fn tick(&self, _elapsed: Duration) {
            if self.running.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.fetch_add(1, Ordering::SeqCst);
            }
            self.ticks.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_micros(200));
            self.running.fetch_sub(1, Ordering::SeqCst);
        }

        fn next_interval(&self) -> Duration {
            self.interval
        }
    }

    #[test]
    fn manual_rounds_tick_every_task_once() {
        let scheduler = Scheduler::new(Scheduling::Manual).unwrap();
        let a = Counter::new(Duration::from_millis(16));
        let b = Counter::new(Duration::from_millis(16));
        scheduler.schedule(TaskId(1), a.clone()).unwrap();
        scheduler.schedule(TaskId(2), b.clone()).unwrap();
        for _ in 0..3 {
            scheduler.run_round(Duration::from_millis(16)).unwrap();
        }
        assert_eq!(a.ticks.load(Ordering::SeqCst), 3);
        assert_eq!(b.ticks.load(Ordering::SeqCst), 3);

        assert!(scheduler.cancel(TaskId(1)));
        assert!(!scheduler.cancel(TaskId(1)));
        scheduler.run_round(Duration::from_millis(16)).unwrap();
        assert_eq!(a.ticks.load(Ordering::SeqCst), 3);
        assert_eq!(b.ticks.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn pooled_scheduler_ticks_repeatedly_without_overlap() {
        let scheduler = Scheduler::new(Scheduling::Pooled { workers: 4 }).unwrap();
        let counters: Vec<_> = (0..8).map(|_| Counter::new(Duration::from_millis(1))).collect();
        for (i, counter) in counters.iter().enumerate() {
            scheduler.schedule(TaskId(i as u64), counter.clone()).unwrap();
        }
        thread::sleep(Duration::from_millis(200));
        scheduler.shutdown();
        for counter in &counters {
            assert!(counter.ticks.load(Ordering::SeqCst) > 5);
            assert_eq!(counter.overlapped.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn cancelled_task_stops_ticking() {
        let scheduler = Scheduler::new(Scheduling::Pooled { workers: 2 }).unwrap();
        let counter = Counter::new(Duration::from_millis(1));
        scheduler.schedule(TaskId(7), counter.clone()).unwrap();
        thread::sleep(Duration::from_millis(50));
        scheduler.cancel(TaskId(7));
        // Let a tick that was already in flight finish.
        thread::sleep(Duration::from_millis(20));
        let after_cancel = counter.ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.ticks.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn schedule_after_shutdown_is_rejected() {
        let scheduler = Scheduler::new(Scheduling::Pooled { workers: 1 }).unwrap();
        scheduler.shutdown();
        scheduler.shutdown();
        let result = scheduler.schedule(TaskId(1), Counter::new(Duration::from_millis(1)));
        assert!(matches!(result, Err(Error::Disposed)));
    }

    #[test]
    fn manual_round_is_unsupported_when_pooled() {
        let scheduler = Scheduler::new(Scheduling::Pooled { workers: 1 }).unwrap();
        assert!(matches!(
            scheduler.run_round(Duration::from_millis(16)),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn adaptive_interval_shrinks_with_speed() {
        let policy = RefreshPolicy::Adaptive {
            min_interval_ms: 2,
            max_interval_ms: 40,
            distance_per_tick: 2.,
        };
        let frame = Duration::from_millis(16);
        let close = |a: Duration, ms: f64| (a.as_secs_f64() * 1000. - ms).abs() < 1e-6;
        assert_eq!(policy.interval(frame, 0.), Duration::from_millis(40));
        assert!(close(policy.interval(frame, 2.), 16.));
        assert!(close(policy.interval(frame, 4.), 8.));
        assert_eq!(policy.interval(frame, 1000.), Duration::from_millis(2));
        assert_eq!(policy.interval(frame, 0.1), Duration::from_millis(40));
        assert_eq!(RefreshPolicy::Fixed.interval(frame, 1000.), frame);
    }
}
