#![doc = include_str!("../README.md")]

mod config;
mod dispatcher;
mod error;
mod event;
mod job;
pub mod queue;
pub mod sync;
mod worker;

pub use config::DispatcherConfig;
pub use dispatcher::{DispatchHandle, Dispatcher};
pub use error::{BoxError, Error, Result};
pub use event::{DEFAULT_TAG, Event, EventLevel, EventSink, MemorySink, SharedSink};
#[cfg(feature = "tracing")]
pub use event::TracingSink;
pub use job::{Job, JobOutput};
pub use worker::Worker;

#[cfg(test)]
mod tests;
