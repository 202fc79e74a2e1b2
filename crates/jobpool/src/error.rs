//! Error types for the job dispatcher.
//!
//! This module defines the central `Error` enum, which captures the misuse and
//! lifecycle cases a caller can observe through the public API. A job that
//! fails is reported as an [`Event`](crate::Event), never returned to the
//! submitter.
//!
//! ## Error Cases
//! - `AlreadyRunning`: [`Dispatcher::run`](crate::Dispatcher::run) was called
//!   a second time.
//! - `NotRunning`: a job was submitted before the dispatcher loop started.
//! - `DispatcherStopped`: a job was submitted after the dispatcher loop exited.
//! - `InvalidConfig`: a [`DispatcherConfig`](crate::DispatcherConfig) failed
//!   validation.

pub type Result<T> = core::result::Result<T, Error>;

/// Boxed error type returned by failing jobs.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for the dispatcher.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The worker pool and dispatcher loop were already started.
    #[error("Dispatcher is already running")]
    AlreadyRunning,

    /// The dispatcher loop has not been started yet.
    #[error("Dispatcher is not running")]
    NotRunning,

    /// The dispatcher loop exited; no further jobs are accepted.
    #[error("Dispatcher has stopped accepting jobs")]
    DispatcherStopped,

    /// The supplied configuration is unusable.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}
