use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the simulation engine.
///
/// Queue saturation in the event logger and coincident body centers are
/// handled where they happen and never show up here.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid caller-supplied value (body count, arena size, vector, config).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The component was already shut down.
    #[error("simulation has been disposed")]
    Disposed,

    /// The event log file could not be opened.
    #[error("event sink unavailable at {path}: {source}")]
    SinkUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Operation not available in the current scheduling mode.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
