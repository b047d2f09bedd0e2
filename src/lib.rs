//! Concurrent 2D bouncing-body simulation.
//!
//! Every body is ticked by a shared [`scheduler::Scheduler`], moves by its
//! velocity, bounces off the arena walls and exchanges impulses with the
//! bodies it touches. Notable happenings go to a bounded JSON-lines
//! [`event_log::EventLogger`]. [`orchestrator::Orchestrator`] ties it together.

pub mod arena;
pub mod body;
pub mod collision;
pub mod error;
pub mod event_log;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod simulation;
mod sync;
pub mod world_gen;

pub use arena::{Arena, ArenaGeometry};
pub use body::{Body, BodyId, Motion, PositionFeed, FEED_CAPACITY};
pub use error::{Error, Result};
pub use event_log::{EventKind, EventLogger, LogEvent};
pub use orchestrator::Orchestrator;
pub use scheduler::{RefreshPolicy, Scheduling};
pub use simulation::{LogConfig, SimulationConfig, SimulationContext};
pub use world_gen::{SpawnConfig, SpeedTier};
