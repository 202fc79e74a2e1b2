//! Job outcome events and the logging collaborator that records them.
//!
//! The pool reports everything a caller may care about (worker startup, job
//! successes, job failures, panics) as discrete [`Event`]s handed to an
//! [`EventSink`]. Recording is fire-and-forget: sinks must not block and have
//! no way to fail the pool.
//!
//! Two sinks ship with the crate:
//!
//! - `TracingSink` forwards every event to `tracing`. This is the default and
//!   needs the `tracing` feature.
//! - [`MemorySink`] keeps events in memory for inspection (tests, summaries).

use core::fmt;
use parking_lot::Mutex;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::SystemTime,
};

/// Context tag attached to events when none is configured.
pub const DEFAULT_TAG: &str = "Worker";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventLevel {
    Info,
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventLevel::Info => write!(f, "info"),
            EventLevel::Error => write!(f, "error"),
        }
    }
}

/// A single recorded occurrence inside the pool.
#[derive(Clone, Debug)]
pub struct Event {
    pub level: EventLevel,
    pub timestamp: SystemTime,
    pub tag: String,
    /// Ordinal of the worker involved, if any.
    pub worker: Option<usize>,
    /// Identifier reported by the job involved, if any.
    pub job_id: Option<String>,
    pub message: String,
}

impl Event {
    pub fn info(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Info, tag, message)
    }

    pub fn error(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Error, tag, message)
    }

    fn new(level: EventLevel, tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: SystemTime::now(),
            tag: tag.into(),
            worker: None,
            job_id: None,
            message: message.into(),
        }
    }

    pub fn with_worker(mut self, worker: usize) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == EventLevel::Error
    }
}

/// Receives events emitted by workers and the dispatcher.
///
/// Implementations are called from many tasks at once and must return
/// promptly.
pub trait EventSink: Send + Sync + 'static {
    fn record(&self, event: Event);
}

/// Shared handle to a sink, cloned into every worker.
pub type SharedSink = Arc<dyn EventSink>;

/// Stamps events with the configured tag before handing them to the sink.
#[derive(Clone)]
pub(crate) struct Reporter {
    sink: SharedSink,
    tag: Arc<str>,
}

impl Reporter {
    pub(crate) fn new(sink: SharedSink, tag: &str) -> Self {
        Self {
            sink,
            tag: Arc::from(tag),
        }
    }

    pub(crate) fn info(&self, message: impl Into<String>) -> Event {
        Event::info(&*self.tag, message)
    }

    pub(crate) fn error(&self, message: impl Into<String>) -> Event {
        Event::error(&*self.tag, message)
    }

    /// Hands `event` to the sink. A panicking sink is contained here so it
    /// cannot take a worker or the dispatcher down with it.
    pub(crate) fn record(&self, event: Event) {
        let sink = &self.sink;
        if let Err(_payload) = panic::catch_unwind(AssertUnwindSafe(|| sink.record(event))) {
            #[cfg(feature = "tracing")]
            tracing::error!(
                "Event sink panicked while recording: {}",
                crate::worker::panic_message(_payload)
            );
        }
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

/// Forwards events to the global `tracing` subscriber.
///
/// The event tag becomes the `context` field; worker ordinal and job
/// identifier are attached as structured fields when present.
#[cfg(feature = "tracing")]
#[derive(Clone, Debug, Default)]
pub struct TracingSink;

#[cfg(feature = "tracing")]
impl TracingSink {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "tracing")]
impl EventSink for TracingSink {
    fn record(&self, event: Event) {
        let Event {
            level,
            tag,
            worker,
            job_id,
            message,
            ..
        } = event;

        match level {
            EventLevel::Info => tracing::info!(
                context = %tag,
                worker = ?worker,
                job_id = ?job_id,
                "{message}"
            ),
            EventLevel::Error => tracing::error!(
                context = %tag,
                worker = ?worker,
                job_id = ?job_id,
                "{message}"
            ),
        }
    }
}

/// Keeps every recorded event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of all events recorded so far, in recording order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn errors(&self) -> Vec<Event> {
        self.filter(EventLevel::Error)
    }

    /// Events that carry a job identifier at the given level.
    pub fn job_events(&self, level: EventLevel) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.level == level && e.job_id.is_some())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn filter(&self, level: EventLevel) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.level == level)
            .cloned()
            .collect()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_attaches_context() {
        let event = Event::error("Pool", "boom").with_worker(3).with_job_id("02");
        assert!(event.is_error());
        assert_eq!(event.tag, "Pool");
        assert_eq!(event.worker, Some(3));
        assert_eq!(event.job_id.as_deref(), Some("02"));
        assert_eq!(event.level.to_string(), "error");
    }

    #[test]
    fn memory_sink_filters_by_level() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());

        sink.record(Event::info(DEFAULT_TAG, "Starting Worker 0").with_worker(0));
        sink.record(Event::info(DEFAULT_TAG, "done").with_job_id("01"));
        sink.record(Event::error(DEFAULT_TAG, "failed").with_job_id("02"));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.errors().len(), 1);
        assert_eq!(sink.job_events(EventLevel::Info).len(), 1);
        assert_eq!(
            sink.job_events(EventLevel::Error)[0].job_id.as_deref(),
            Some("02")
        );
    }

    #[test]
    fn reporter_stamps_configured_tag() {
        let memory = Arc::new(MemorySink::new());
        let reporter = Reporter::new(memory.clone(), "Pool");
        reporter.record(reporter.info("hello").with_worker(1));
        reporter.record(reporter.error("oops"));
        #[cfg(feature = "tracing")]
        TracingSink::new().record(Event::info(DEFAULT_TAG, "hello"));

        let events = memory.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.tag == "Pool"));
        assert_eq!(events[0].worker, Some(1));
        assert!(events[1].is_error());
    }

    struct FlakySink {
        inner: MemorySink,
    }

    impl EventSink for FlakySink {
        fn record(&self, event: Event) {
            if event.message.contains("boom") {
                panic!("sink rejected {}", event.message);
            }
            self.inner.record(event);
        }
    }

    #[test]
    fn reporter_contains_panicking_sink() {
        let sink = Arc::new(FlakySink {
            inner: MemorySink::new(),
        });
        let reporter = Reporter::new(sink.clone(), DEFAULT_TAG);

        reporter.record(reporter.info("boom"));
        reporter.record(reporter.info("after"));

        let events = sink.inner.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "after");
    }
}
