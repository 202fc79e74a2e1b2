//! Dispatcher configuration.
//!
//! [`DispatcherConfig`] controls how many workers the pool runs, whether
//! shutdown waits are bounded, and the context tag attached to every event.

use crate::{
    error::{Error, Result},
    event::DEFAULT_TAG,
};
use core::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Number of workers started by [`Dispatcher::run`](crate::Dispatcher::run).
    ///
    /// Zero is allowed: such a pool quits cleanly but reports every dispatched
    /// job as lost.
    pub max_workers: usize,

    /// Upper bound for each shutdown wait (drain, worker stop, dispatcher
    /// stop). `None` waits forever, so a hung job blocks
    /// [`Dispatcher::quit`](crate::Dispatcher::quit).
    pub shutdown_timeout: Option<Duration>,

    /// Context tag attached to every event.
    pub tag: String,
}

impl DispatcherConfig {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            ..Self::default()
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the tag is blank.
    pub fn validate(&self) -> Result<()> {
        if self.tag.trim().is_empty() {
            return Err(Error::InvalidConfig {
                reason: "event tag must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get(),
            shutdown_timeout: None,
            tag: DEFAULT_TAG.to_string(),
        }
    }
}
