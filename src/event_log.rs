//! Bounded, non-blocking JSON-lines event log.
//!
//! Bodies push [`LogEvent`]s from their ticks; a single `event-log` thread
//! writes them out one per line and flushes after each. The queue is a
//! fixed-capacity channel: when it is full the event is dropped and counted,
//! and the consumer later writes an `Error` line saying how many were lost.

use crate::error::{Error, Result};
use crate::sync;
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{error, info, warn};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    BodyCreated,
    BodyStopped,
    LeftBorderCollision,
    RightBorderCollision,
    TopBorderCollision,
    BottomBorderCollision,
    BodyCollision,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl From<Vector2<f64>> for Point {
    fn from(v: Vector2<f64>) -> Self {
        Point { x: v.x, y: v.y }
    }
}

/// One line of the event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub event_type: EventKind,
    pub thread_id: u64,
    pub position: Point,
    pub velocity: Point,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LogEvent {
    pub fn new(kind: EventKind, position: Vector2<f64>, velocity: Vector2<f64>) -> LogEvent {
        LogEvent {
            timestamp: now_millis(),
            event_type: kind,
            thread_id: current_thread_id(),
            position: position.into(),
            velocity: velocity.into(),
            detail: None,
        }
    }

    pub fn error(detail: impl Into<String>) -> LogEvent {
        LogEvent {
            detail: Some(detail.into()),
            ..LogEvent::new(EventKind::Error, Vector2::zeros(), Vector2::zeros())
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Small, stable numeric id for the calling thread.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// What happened to an event handed to [`EventLogger::log`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogOutcome {
    Queued,
    /// Queue full; counted and reported later.
    Dropped,
    /// Logger shut down or its consumer is gone.
    Closed,
}

type Sink = Box<dyn Write + Send>;

struct Consumer {
    shutdown: Sender<Instant>,
    finished: Receiver<()>,
    handle: JoinHandle<()>,
}

pub struct EventLogger {
    events: Sender<LogEvent>,
    // Held shared while enqueueing; `shutdown` takes it exclusively to close.
    accepting: RwLock<bool>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
    consumer: Mutex<Option<Consumer>>,
}

impl EventLogger {
    /// Appends to `path`, creating it and its directory if needed.
    ///
    /// A sink that cannot be opened is reported and replaced by nothing:
    /// events are still accepted and drained, just not written.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<EventLogger> {
        let path = path.as_ref();
        match open_sink(path) {
            Ok(sink) => EventLogger::spawn(Some(sink), capacity),
            Err(e) => {
                error!("event log {} unavailable, events will be discarded: {e}", path.display());
                EventLogger::spawn(None, capacity)
            }
        }
    }

    /// Like [`EventLogger::open`], but fails if the file cannot be opened.
    pub fn open_strict(path: impl AsRef<Path>, capacity: usize) -> Result<EventLogger> {
        let path = path.as_ref();
        let sink = open_sink(path).map_err(|source| Error::SinkUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
        EventLogger::spawn(Some(sink), capacity)
    }

    pub fn with_writer<W>(writer: W, capacity: usize) -> Result<EventLogger>
    where
        W: Write + Send + 'static,
    {
        EventLogger::spawn(Some(Box::new(writer)), capacity)
    }

    pub fn discard(capacity: usize) -> Result<EventLogger> {
        EventLogger::with_writer(io::sink(), capacity)
    }

    fn spawn(sink: Option<Sink>, capacity: usize) -> Result<EventLogger> {
        if capacity == 0 {
            return Err(Error::InvalidArgument(
                "event queue capacity must be greater than 0".to_string(),
            ));
        }
        let (events, queue) = bounded(capacity);
        let (shutdown, shutdown_rx) = bounded(1);
        let (finished_tx, finished) = bounded(0);
        let dropped = Arc::new(AtomicU64::new(0));

        let writer = SinkWriter {
            sink,
            dropped: dropped.clone(),
            reported_drops: 0,
            failures: 0,
        };
        let handle = thread::Builder::new()
            .name("event-log".to_string())
            .spawn(move || drain(queue, shutdown_rx, writer, finished_tx))
            .map_err(Error::Spawn)?;

        Ok(EventLogger {
            events,
            accepting: RwLock::new(true),
            dropped,
            capacity,
            consumer: Mutex::new(Some(Consumer {
                shutdown,
                finished,
                handle,
            })),
        })
    }

    /// Enqueues without blocking.
    pub fn log(&self, event: LogEvent) -> LogOutcome {
        let accepting = sync::read(&self.accepting);
        if !*accepting {
            return LogOutcome::Closed;
        }
        match self.events.try_send(event) {
            Ok(()) => LogOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                LogOutcome::Dropped
            }
            Err(TrySendError::Disconnected(_)) => LogOutcome::Closed,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.events.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_accepting(&self) -> bool {
        *sync::read(&self.accepting)
    }

    /// Stops accepting events and drains what is queued, for at most `timeout`.
    ///
    /// Returns `false` when the consumer did not finish in time (it is then
    /// left detached). Calling it again is a no-op that returns `true`.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        *sync::write(&self.accepting) = false;
        let consumer = match sync::lock(&self.consumer).take() {
            Some(consumer) => consumer,
            None => return true,
        };

        let deadline = Instant::now() + timeout;
        // Fails only if the consumer already exited, which is what we want anyway.
        let _ = consumer.shutdown.send(deadline);
        match consumer.finished.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                if consumer.handle.join().is_err() {
                    warn!("event log consumer panicked");
                }
                // Only a consumer that died early leaves events behind.
                let unwritten = self.queued() as u64;
                self.dropped.fetch_add(unwritten, Ordering::Relaxed);
                info!(
                    "event log closed ({} dropped, {} left unwritten)",
                    self.dropped(),
                    unwritten
                );
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "event log did not drain within {:?}, {} events abandoned",
                    timeout,
                    self.queued()
                );
                false
            }
        }
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        self.shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
    }
}

fn open_sink(path: &Path) -> io::Result<Sink> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Box::new(file))
}

struct SinkWriter {
    sink: Option<Sink>,
    dropped: Arc<AtomicU64>,
    reported_drops: u64,
    failures: u64,
}

impl SinkWriter {
    fn write(&mut self, event: &LogEvent) {
        let sink = match self.sink.as_mut() {
            Some(sink) => sink,
            None => return,
        };
        if let Err(e) = write_line(sink, event) {
            self.failures += 1;
            if self.failures == 1 || self.failures % 1000 == 0 {
                error!("failed to write event log entry ({} so far): {e}", self.failures);
            }
        }
    }

    fn report_drops(&mut self) {
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > self.reported_drops {
            let lost = dropped - self.reported_drops;
            self.reported_drops = dropped;
            warn!("event queue saturated, dropped {lost} events");
            self.write(&LogEvent::error(format!(
                "event queue full, dropped {lost} events"
            )));
        }
    }
}

fn write_line<W: Write + ?Sized>(sink: &mut W, event: &LogEvent) -> io::Result<()> {
    serde_json::to_writer(&mut *sink, event)?;
    sink.write_all(b"\n")?;
    sink.flush()
}

fn drain(
    queue: Receiver<LogEvent>,
    shutdown: Receiver<Instant>,
    mut writer: SinkWriter,
    _finished: Sender<()>,
) {
    loop {
        let running = select! {
            recv(queue) -> event => match event {
                Ok(event) => {
                    writer.write(&event);
                    true
                }
                Err(_) => false,
            },
            recv(shutdown) -> deadline => {
                let deadline = deadline.unwrap_or_else(|_| Instant::now());
                while Instant::now() < deadline {
                    match queue.try_recv() {
                        Ok(event) => writer.write(&event),
                        Err(_) => break,
                    }
                }
                false
            },
        };
        writer.report_drops();
        if !running {
            break;
        }
    }
}
