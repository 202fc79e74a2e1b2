//! Countdown barrier used to join the worker pool and in-flight hand-offs.
//!
//! [`WaitGroup`] is a cloneable counter: tasks register with [`WaitGroup::add`]
//! (or [`WaitGroup::enter`]) and deregister with [`WaitGroup::done`], while any
//! number of waiters suspend until the count drops to a threshold. The counter
//! is atomic and waiters are woken through a [`Notify`], so no lock is held
//! across an await point.

use portable_atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    count: AtomicUsize,
    notify: Notify,
}

/// A cloneable countdown barrier.
#[derive(Clone, Debug, Default)]
pub struct WaitGroup {
    inner: Arc<Inner>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `n` more participants.
    pub fn add(&self, n: usize) {
        self.inner.count.fetch_add(n, Ordering::AcqRel);
    }

    /// Deregisters one participant and wakes waiters.
    ///
    /// Calling `done` more often than `add` is a bug; the count saturates at
    /// zero instead of wrapping.
    pub fn done(&self) {
        let previous = self
            .inner
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));

        if previous.is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!("WaitGroup::done called with no registered participants");
        }
        self.inner.notify.notify_waiters();
    }

    /// Registers one participant and returns a guard that deregisters it on
    /// drop.
    #[must_use = "dropping the guard immediately deregisters the participant"]
    pub fn enter(&self) -> WaitGuard {
        self.add(1);
        WaitGuard {
            group: self.clone(),
        }
    }

    /// Current number of registered participants.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Suspends until every participant has called [`done`](Self::done).
    pub async fn wait(&self) {
        self.wait_until(0).await;
    }

    /// Suspends until at most `remaining` participants are registered.
    pub async fn wait_until(&self, remaining: usize) {
        loop {
            // Register interest before checking the count so a `done` racing
            // with the check cannot be missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() <= remaining {
                return;
            }
            notified.await;
        }
    }
}

/// Deregisters its participant from a [`WaitGroup`] when dropped.
#[derive(Debug)]
pub struct WaitGuard {
    group: WaitGroup,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.group.done();
    }
}
