//! Error types of the scheduling surface.

use thiserror::Error;

/// Failures of the thread and process lifecycle operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    /// The id names no live thread, process, or core. Stale generations land
    /// here: once a slot is reused, old ids miss instead of aliasing.
    #[error("no such object")]
    NoSuchObject,

    /// The target thread has terminated and only awaits reaping.
    #[error("thread is dead")]
    ThreadDead,

    /// A parameter is outside its valid range, or the operation would break
    /// a structural invariant (reaping a live thread, killing an idle
    /// thread, an affinity mask matching no registered core).
    #[error("invalid parameter")]
    InvalidParameter,
}

/// Failures of [`Mutex`](crate::Mutex) operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MutexError {
    /// The lock is held and the caller asked not to block.
    #[error("mutex is locked")]
    Locked,

    /// The calling thread does not own the lock; its state is unchanged.
    #[error("access denied: not the lock owner")]
    AccessDenied,

    /// The wait deadline passed before the lock could be acquired.
    #[error("timed out waiting for the mutex")]
    Timeout,

    /// The mutex was abandoned; it never locks again.
    #[error("mutex abandoned")]
    Abandoned,
}
