//! Capabilities through which sizing code asks a heap to change its capacity.
//!
//! Nothing here knows about the concrete heap type, so decision code can be driven
//! against doubles that only record the requested amounts.

use std::{io, num::NonZeroUsize};

use crate::workers::WorkerSet;

#[derive(Debug, thiserror::Error)]
pub enum ExpandError {
    #[error("cannot expand by {requested} bytes, only {available} bytes left in the reservation")]
    ExceedsReservation { requested: usize, available: usize },
    #[error("failed to commit heap memory")]
    CommitFailed(#[from] io::Error),
}

/// Commits additional heap capacity.
pub trait HeapExpander: Send + Sync {
    /// Grows the heap by at least `bytes`, spreading the work over `workers`.
    /// Blocks until the memory is committed or the expansion failed. Returns the
    /// number of bytes actually committed.
    fn expand(&self, bytes: NonZeroUsize, workers: &WorkerSet) -> Result<usize, ExpandError>;
}

/// Releases heap capacity.
///
/// The caller does not hold any heap lock. Implementations must return without
/// waiting for the memory to be released and must eventually attempt the shrink,
/// typically at the next safe point.
pub trait HeapShrinker: Send + Sync {
    fn request_shrink(&self, bytes: NonZeroUsize);
}
