//! Job dispatcher and pool coordinator.
//!
//! [`Dispatcher`] owns the workers, the availability queue, the public
//! submission channel and two [`WaitGroup`]s: one counting live workers, one
//! counting in-flight hand-offs (plus the dispatcher loop itself).
//!
//! Submitted jobs are accepted by a single dispatcher loop. For every job the
//! loop spawns a hand-off task that claims the next idle worker's slot and
//! forwards the job through it. Only that hand-off task waits for a worker, so
//! [`Dispatcher::dispatch`] returns as soon as the loop has accepted the job,
//! even while every worker is busy.
//!
//! ## Shutdown
//!
//! [`Dispatcher::quit`] runs strictly in this order:
//!
//! 1. Drain: wait until every accepted job has been handed to a worker.
//! 2. Stop every worker and wait for the pool group to empty. Workers finish
//!    the job they hold before observing the stop signal.
//! 3. Signal the dispatcher loop and wait for the in-flight group to empty.
//!
//! Stopping workers before the loop matters: a hand-off still waiting for a
//! slot after its workers are gone could never complete.

use crate::{
    config::DispatcherConfig,
    error::{Error, Result},
    event::{Reporter, SharedSink},
    job::Job,
    queue::{ClaimError, QueueReceiver, QueueSender, availability_queue, claim_and_deliver},
    sync::{WaitGroup, WaitGuard},
    worker::{Worker, panic_message},
};
use core::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Share of the in-flight group held by the dispatcher loop while it runs.
const LOOP_SHARE: usize = 1;

/// A job waiting for the dispatcher loop, with the acceptance reply.
struct Submission {
    job: Job,
    accepted: oneshot::Sender<()>,
}

/// Resources created by the constructor and consumed by [`Dispatcher::run`].
struct Pending {
    queue_tx: QueueSender,
    submissions: mpsc::Receiver<Submission>,
    quit_rx: oneshot::Receiver<()>,
}

/// Cloneable submission handle for callers that outlive a borrow of the
/// [`Dispatcher`].
#[derive(Clone, Debug)]
pub struct DispatchHandle {
    submissions: mpsc::Sender<Submission>,
}

impl DispatchHandle {
    /// Submits a job and waits until the dispatcher loop accepts it.
    ///
    /// Acceptance does not wait for a worker: the job is parked in a hand-off
    /// task until one becomes idle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DispatcherStopped`] if the dispatcher loop has exited.
    pub async fn dispatch(&self, job: impl Into<Job>) -> Result<()> {
        let (accepted, accepted_rx) = oneshot::channel();
        let submission = Submission {
            job: job.into(),
            accepted,
        };

        self.submissions
            .send(submission)
            .await
            .map_err(|_| Error::DispatcherStopped)?;
        accepted_rx.await.map_err(|_| Error::DispatcherStopped)
    }
}

impl core::fmt::Debug for Submission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Submission").finish_non_exhaustive()
    }
}

/// Coordinates a fixed pool of [`Worker`]s.
pub struct Dispatcher {
    config: DispatcherConfig,
    reporter: Reporter,
    workers: Vec<Worker>,
    queue: QueueReceiver,
    submissions: mpsc::Sender<Submission>,
    workers_group: WaitGroup,
    inflight_group: WaitGroup,
    shutdown_token: CancellationToken,
    quit_tx: Option<oneshot::Sender<()>>,
    pending: Option<Pending>,
    supervisor: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Creates a dispatcher for `max_workers` workers that reports through
    /// `TracingSink`.
    ///
    /// Nothing is spawned until [`run`](Self::run).
    #[cfg(feature = "tracing")]
    pub fn new(max_workers: usize) -> Self {
        Self::build(
            DispatcherConfig::new(max_workers),
            std::sync::Arc::new(crate::event::TracingSink::new()),
        )
    }

    /// Creates a dispatcher from a full configuration and a custom sink.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` fails validation.
    pub fn with_config(config: DispatcherConfig, sink: SharedSink) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, sink))
    }

    fn build(config: DispatcherConfig, sink: SharedSink) -> Self {
        let (queue_tx, queue) = availability_queue(config.max_workers);
        // Submissions rendezvous with the loop through the acceptance reply;
        // the channel itself only needs room for the one being handed over.
        let (submissions, submissions_rx) = mpsc::channel(1);
        let (quit_tx, quit_rx) = oneshot::channel();
        let reporter = Reporter::new(sink, &config.tag);

        Self {
            workers: Vec::with_capacity(config.max_workers),
            reporter,
            queue,
            submissions,
            workers_group: WaitGroup::new(),
            inflight_group: WaitGroup::new(),
            shutdown_token: CancellationToken::new(),
            quit_tx: Some(quit_tx),
            pending: Some(Pending {
                queue_tx,
                submissions: submissions_rx,
                quit_rx,
            }),
            supervisor: None,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// `true` between [`run`](Self::run) and the dispatcher loop exiting.
    pub fn is_running(&self) -> bool {
        self.pending.is_none()
            && self
                .supervisor
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Returns a cloneable handle for submitting jobs from other tasks.
    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            submissions: self.submissions.clone(),
        }
    }

    /// Starts every worker, then the dispatcher loop.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if called more than once.
    pub fn run(&mut self) -> Result<()> {
        let Pending {
            queue_tx,
            submissions,
            quit_rx,
        } = self.pending.take().ok_or(Error::AlreadyRunning)?;

        self.reporter.record(self.reporter.info("Starting Dispatcher"));

        for id in 0..self.config.max_workers {
            let mut worker = Worker::new(
                id,
                queue_tx.clone(),
                self.workers_group.clone(),
                self.shutdown_token.clone(),
                self.reporter.clone(),
            );
            worker.start();
            self.workers.push(worker);
        }
        // Workers hold the only producers; the queue closes once all exit.
        drop(queue_tx);

        let loop_guard = self.inflight_group.enter();
        let dispatch = tokio::spawn(dispatch_loop(
            submissions,
            quit_rx,
            self.queue.clone(),
            self.inflight_group.clone(),
            loop_guard,
            self.reporter.clone(),
        ));

        self.supervisor = Some(tokio::spawn(supervise(
            dispatch,
            self.shutdown_token.clone(),
            self.workers_group.clone(),
            self.reporter.clone(),
        )));

        #[cfg(feature = "tracing")]
        tracing::info!("Dispatcher started with {} workers", self.config.max_workers);
        Ok(())
    }

    /// Submits a job; see [`DispatchHandle::dispatch`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] before [`run`](Self::run) and
    /// [`Error::DispatcherStopped`] if the dispatcher loop has exited.
    pub async fn dispatch(&self, job: impl Into<Job>) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::NotRunning);
        }
        self.handle().dispatch(job).await
    }

    /// Shuts the pool down: drain hand-offs, stop workers, stop the loop.
    ///
    /// Consuming `self` rules out a second `quit` and further dispatches
    /// through this value. Handles obtained from [`handle`](Self::handle)
    /// receive [`Error::DispatcherStopped`] afterwards.
    ///
    /// Without a configured shutdown timeout this waits for every accepted
    /// job to finish, so a job that never returns blocks here forever.
    pub async fn quit(mut self) {
        self.reporter
            .record(self.reporter.info("Dispatcher will quit. Stopping workers ..."));
        let limit = self.config.shutdown_timeout;

        let inflight = self.inflight_group.clone();
        if !bounded(limit, "drain", inflight.wait_until(LOOP_SHARE)).await {
            #[cfg(feature = "tracing")]
            tracing::warn!("{} hand-offs still waiting for a worker", inflight.count());
        }

        // Phase 1: workers.
        let workers_done = bounded(limit, "stop workers", async {
            for worker in &mut self.workers {
                worker.stop().await;
            }
            self.workers_group.wait().await;
        })
        .await;
        if !workers_done {
            self.shutdown_token.cancel();
        }
        self.reporter.record(self.reporter.info("Workers stopped"));

        // Phase 2: dispatcher loop and any hand-off still underway.
        if let Some(quit_tx) = self.quit_tx.take() {
            if quit_tx.send(()).is_err() {
                #[cfg(feature = "tracing")]
                tracing::debug!("Dispatcher loop already exited");
            }
        }
        bounded(limit, "stop dispatcher", self.inflight_group.wait()).await;

        if let Some(supervisor) = self.supervisor.take() {
            bounded(limit, "join supervisor", async {
                if let Err(_e) = supervisor.await {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Dispatcher supervisor failed: {_e}");
                }
            })
            .await;
        }

        self.reporter.record(self.reporter.info("Dispatcher finished"));
    }
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("workers", &self.workers.len())
            .field("active_workers", &self.workers_group.count())
            .field("inflight", &self.inflight_group.count())
            .finish_non_exhaustive()
    }
}

/// Awaits `fut`, giving up after `limit` if one is set. Returns `false` on
/// timeout.
async fn bounded(limit: Option<Duration>, _phase: &str, fut: impl Future<Output = ()>) -> bool {
    let Some(limit) = limit else {
        fut.await;
        return true;
    };

    match tokio::time::timeout(limit, fut).await {
        Ok(()) => true,
        Err(_) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Shutdown phase '{_phase}' timed out after {limit:?}");
            false
        }
    }
}

/// Accepts submissions until the quit signal arrives.
///
/// `loop_guard` is the loop's own share of the in-flight group; it is released
/// on quit or, if the loop panics, during unwinding.
async fn dispatch_loop(
    mut submissions: mpsc::Receiver<Submission>,
    mut quit_rx: oneshot::Receiver<()>,
    queue: QueueReceiver,
    inflight: WaitGroup,
    loop_guard: WaitGuard,
    reporter: Reporter,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Dispatcher loop started");

    // Submission sequence number, used to name a job before it has run.
    let mut seq: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut quit_rx => break,
            submission = submissions.recv() => {
                let Some(Submission { job, accepted }) = submission else {
                    // Every submitter is gone; only the quit signal remains.
                    let _ = (&mut quit_rx).await;
                    break;
                };

                // Count the hand-off before acknowledging so `quit` issued
                // right after `dispatch` returns always sees it.
                let handoff = inflight.enter();
                seq += 1;
                if accepted.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Submitter stopped waiting for acceptance");
                }
                tokio::spawn(hand_off(seq, job, queue.clone(), handoff, reporter.clone()));
            }
        }
    }

    drop(loop_guard);
    #[cfg(feature = "tracing")]
    tracing::trace!("Dispatcher loop stopped");
}

/// Claims an idle worker for one job; holds a share of the in-flight group
/// until the job is handed over or reported lost.
async fn hand_off(
    seq: u64,
    job: Job,
    queue: QueueReceiver,
    _handoff: WaitGuard,
    reporter: Reporter,
) {
    match claim_and_deliver(&queue, job).await {
        Ok(_worker) => {
            #[cfg(feature = "tracing")]
            tracing::trace!("Job #{seq} handed to worker {_worker}");
        }
        Err(ClaimError::NoWorkers(_)) => {
            reporter.record(reporter.error(format!(
                "No worker left to run job #{seq} (submission order); job dropped"
            )));
        }
    }
}

/// Waits for the dispatcher loop and runs the emergency shutdown if it
/// panicked: every worker is cancelled and joined so no caller is left
/// blocked on a pool that can no longer make progress.
pub(crate) async fn supervise(
    dispatch: JoinHandle<()>,
    shutdown_token: CancellationToken,
    workers_group: WaitGroup,
    reporter: Reporter,
) {
    match dispatch.await {
        Ok(()) => {}
        Err(e) if e.is_panic() => {
            let reason = panic_message(e.into_panic());
            reporter.record(reporter.error(format!("Panic on Dispatcher. {reason}")));
            shutdown_token.cancel();
            workers_group.wait().await;
        }
        Err(_) => {
            #[cfg(feature = "tracing")]
            tracing::debug!("Dispatcher loop cancelled");
            shutdown_token.cancel();
        }
    }
}
