//! Error taxonomy of the cycling engine.
//!
//! `InsufficientCandidates`, `NoPool` and `BuildInProgress` are recoverable:
//! the next timer tick simply tries again. `Disposed` means the caller kept
//! using a cycler after shutting it down.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CycleError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not enough usable wallpapers: {required} required, {available} available")]
    InsufficientCandidates { required: usize, available: usize },
    #[error("no wallpapers available: {0}")]
    NoPool(String),
    #[error("a wallpaper build is already in progress")]
    BuildInProgress,
    #[error("interval {requested:?} is below the minimum of {minimum:?}")]
    IntervalTooShort { requested: Duration, minimum: Duration },
    #[error("the cycler has been disposed")]
    Disposed,
}

impl CycleError {
    /// Whether retrying later (e.g. on the next tick) can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CycleError::InsufficientCandidates { .. }
                | CycleError::NoPool(_)
                | CycleError::BuildInProgress
        )
    }
}
