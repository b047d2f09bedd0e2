//! Border reflection and pairwise elastic collision resolution.
//!
//! Everything here works on plain vectors handed in by the caller; the only
//! shared state touched is the other body's motion inside a registry scan.

pub mod border;
pub mod resolver;

pub use border::{reflect_off_borders, Border};
pub use resolver::{CollisionResolver, Contact, PairOutcome, Resolution};

/// Slack used when comparing a body's edge against the arena boundary.
pub const EPSILON: f64 = 1e-4;
