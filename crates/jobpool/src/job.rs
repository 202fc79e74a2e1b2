//! Units of work accepted by the dispatcher.
//!
//! A [`Job`] is a zero-argument closure that reports an identifier and an
//! optional error through [`JobOutput`]. Ownership of the closure moves into
//! the pool at submission; the pool invokes it exactly once.

use crate::error::BoxError;
use core::fmt;

/// The outcome reported by a finished job.
#[derive(Debug)]
pub struct JobOutput {
    /// Caller-chosen identifier used in success and failure events.
    pub id: String,
    /// `Some` when the job failed. Failures are reported, never retried.
    pub error: Option<BoxError>,
}

impl JobOutput {
    /// A successful outcome for the job identified by `id`.
    pub fn success(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: None,
        }
    }

    /// A failed outcome for the job identified by `id`.
    pub fn failure(id: impl Into<String>, error: impl Into<BoxError>) -> Self {
        Self {
            id: id.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A unit of work submitted to a [`Dispatcher`](crate::Dispatcher).
///
/// Jobs are synchronous. Workers run them on Tokio's blocking pool so a slow
/// job never stalls the async scheduler.
pub struct Job {
    task: Box<dyn FnOnce() -> JobOutput + Send + 'static>,
}

impl Job {
    pub fn new<F>(task: F) -> Self
    where
        F: FnOnce() -> JobOutput + Send + 'static,
    {
        Self {
            task: Box::new(task),
        }
    }

    /// Consumes the job and runs it on the current thread.
    pub fn run(self) -> JobOutput {
        (self.task)()
    }
}

impl<F> From<F> for Job
where
    F: FnOnce() -> JobOutput + Send + 'static,
{
    fn from(task: F) -> Self {
        Self::new(task)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").finish_non_exhaustive()
    }
}
