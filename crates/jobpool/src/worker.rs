//! Pool members that execute one job at a time.
//!
//! A [`Worker`] owns a private job channel. Whenever it is idle it publishes a
//! [`JobSlot`] for that channel into the shared availability queue, then waits
//! for either a job to arrive through the slot, a stop signal, or the pool-wide
//! emergency [`CancellationToken`].
//!
//! ## Lifecycle
//!
//! `Created -> Idle -> Executing -> Idle -> ... -> Stopped`
//!
//! - `Idle -> Executing` on job receipt.
//! - `Executing -> Idle` once the job returns, whether it succeeded or failed.
//! - any state `-> Stopped` on a stop signal (observed once the current job, if
//!   any, returns), on emergency cancellation, or when a job panics.
//!
//! The loop owns a [`WaitGuard`] on the pool [`WaitGroup`]. It is released on
//! every exit path, unwinding and task abort included, so joining the pool
//! never hangs on a dead worker.

use crate::{
    event::Reporter,
    job::{Job, JobOutput},
    queue::{JobSlot, QueueSender},
    sync::{WaitGroup, WaitGuard},
};
use core::any::Any;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Stop request carrying the acknowledgement channel.
type StopSignal = oneshot::Sender<()>;

/// A pool member identified by its ordinal.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    /// Moved into the processing loop on start, so the queue closes once
    /// every started worker has exited.
    queue: Option<QueueSender>,
    shared_group: WaitGroup,
    shutdown_token: CancellationToken,
    reporter: Reporter,
    stop_tx: Option<oneshot::Sender<StopSignal>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        queue: QueueSender,
        shared_group: WaitGroup,
        shutdown_token: CancellationToken,
        reporter: Reporter,
    ) -> Self {
        Self {
            id,
            queue: Some(queue),
            shared_group,
            shutdown_token,
            reporter,
            stop_tx: None,
            handle: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// `true` once the worker's processing loop has exited (stopped, cancelled
    /// or panicked). A worker that was never started is not finished.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_some_and(JoinHandle::is_finished)
    }

    /// Registers with the pool group and spawns the processing loop.
    ///
    /// Must be called from within a Tokio runtime. Starting a worker twice is
    /// ignored.
    pub fn start(&mut self) {
        let Some(queue) = self.queue.take() else {
            #[cfg(feature = "tracing")]
            tracing::warn!("Worker {} already started", self.id);
            return;
        };

        self.reporter
            .record(self.reporter.info(format!("Starting Worker {}", self.id)).with_worker(self.id));

        let pool_guard = self.shared_group.enter();

        // One job per slot: the channel never needs to buffer more than the
        // job handed through the currently published slot.
        let (job_tx, job_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        let task = WorkerTask {
            id: self.id,
            job_tx,
            job_rx,
            stop_rx,
            queue,
            pool_guard,
            shutdown_token: self.shutdown_token.clone(),
            reporter: self.reporter.clone(),
        };
        self.handle = Some(tokio::spawn(task.run()));
    }

    /// Signals the worker to stop and waits until its loop observes the
    /// signal.
    ///
    /// A job already executing runs to completion first. Stopping a worker
    /// that already exited returns immediately; stopping twice is a logged
    /// no-op.
    pub async fn stop(&mut self) {
        let Some(stop_tx) = self.stop_tx.take() else {
            #[cfg(feature = "tracing")]
            tracing::warn!("Worker {} was not running or was already stopped", self.id);
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if stop_tx.send(ack_tx).is_err() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Worker {} exited before the stop signal", self.id);
            return;
        }

        if ack_rx.await.is_err() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Worker {} exited without acknowledging stop", self.id);
        }
    }
}

/// How a worker's processing loop ended.
enum Exit {
    Stopped(Option<StopSignal>),
    Cancelled,
    Panicked,
    Aborted,
}

/// State moved into the spawned processing loop.
struct WorkerTask {
    id: usize,
    job_tx: mpsc::Sender<Job>,
    job_rx: mpsc::Receiver<Job>,
    stop_rx: oneshot::Receiver<StopSignal>,
    queue: QueueSender,
    pool_guard: WaitGuard,
    shutdown_token: CancellationToken,
    reporter: Reporter,
}

impl WorkerTask {
    async fn run(mut self) {
        let id = self.id;
        #[cfg(feature = "tracing")]
        tracing::trace!("Worker {id} started");

        let exit = loop {
            // Idle: offer exactly one slot until a job arrives through it.
            let slot = JobSlot::new(id, self.job_tx.clone());
            if self.queue.send(slot).await.is_err() {
                break Exit::Aborted;
            }

            // A job already handed through the slot wins over a concurrent stop
            // signal so nothing accepted by the dispatcher is dropped.
            tokio::select! {
                biased;
                Some(job) = self.job_rx.recv() => {
                    if let Err(exit) = self.execute(job).await {
                        break exit;
                    }
                }
                signal = &mut self.stop_rx => break Exit::Stopped(signal.ok()),
                () = self.shutdown_token.cancelled() => break Exit::Cancelled,
            }
        };

        match &exit {
            Exit::Stopped(_) => {
                self.reporter
                    .record(self.reporter.info(format!("Stopping Worker {id}")).with_worker(id));
            }
            Exit::Cancelled => {
                self.reporter.record(
                    self.reporter
                        .info(format!("Worker {id} stopped by emergency shutdown"))
                        .with_worker(id),
                );
            }
            Exit::Panicked => {}
            Exit::Aborted => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {id} lost the availability queue");
            }
        }

        self.drain(&exit).await;
        drop(self.pool_guard);

        if let Exit::Stopped(Some(ack)) = exit {
            if ack.send(()).is_err() {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {id} stop acknowledgement went unobserved");
            }
        }

        #[cfg(feature = "tracing")]
        tracing::trace!("Worker {id} stopped");
    }

    /// Closes the private channel and settles any job still buffered in it.
    ///
    /// A claimant may have delivered through the last slot while the stop
    /// branch was being taken. After a stop such a job still runs; after any
    /// other exit it is reported as dropped. Closing rejects later deliveries,
    /// which then move on to another slot.
    async fn drain(&mut self, exit: &Exit) {
        let id = self.id;
        self.job_rx.close();

        while let Ok(job) = self.job_rx.try_recv() {
            if matches!(exit, Exit::Stopped(_)) {
                if self.execute(job).await.is_err() {
                    break;
                }
            } else {
                self.reporter.record(
                    self.reporter
                        .error(format!("Worker {id} exited before running a job; job dropped"))
                        .with_worker(id),
                );
            }
        }
    }

    /// Runs one job on the blocking pool and reports its outcome.
    ///
    /// Returns `Err` when the worker must terminate.
    async fn execute(&self, job: Job) -> Result<(), Exit> {
        let id = self.id;
        self.reporter.record(
            self.reporter
                .info(format!("Worker {id}. Will execute a job ..."))
                .with_worker(id),
        );

        match tokio::task::spawn_blocking(move || job.run()).await {
            Ok(JobOutput {
                id: job_id,
                error: None,
            }) => {
                self.reporter.record(
                    self.reporter
                        .info(format!("Worker {id}. [{job_id}] executed with success"))
                        .with_worker(id)
                        .with_job_id(job_id),
                );
                Ok(())
            }
            Ok(JobOutput {
                id: job_id,
                error: Some(err),
            }) => {
                self.reporter.record(
                    self.reporter
                        .error(format!("Worker {id}. [{job_id}] failed: {err}"))
                        .with_worker(id)
                        .with_job_id(job_id),
                );
                Ok(())
            }
            Err(e) if e.is_panic() => {
                let reason = panic_message(e.into_panic());
                self.reporter.record(
                    self.reporter
                        .error(format!("Panic on Worker {id}. {reason}"))
                        .with_worker(id),
                );
                Err(Exit::Panicked)
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {id} job was cancelled by runtime shutdown");
                Err(Exit::Aborted)
            }
        }
    }
}

/// Renders a panic payload the way the default hook does.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
