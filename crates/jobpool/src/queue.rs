//! The availability queue: a shared registry of idle workers.
//!
//! Every idle worker publishes exactly one [`JobSlot`] (the sending half of
//! its private job channel) into the queue. A claimant removes a slot and
//! hands one job through it. Because removal is destructive, at most one
//! claimant ever holds a given worker's slot, and a slot exists in the queue
//! only while its worker is idle.
//!
//! The queue is multi-producer (every worker) and multi-consumer (every
//! in-flight hand-off), so it is backed by [`async_channel`]. Once every worker
//! has exited and dropped its producer half, the queue closes and pending
//! claimants observe [`ClaimError::NoWorkers`] instead of waiting forever.

use crate::job::Job;
use tokio::sync::mpsc;

/// Capability to hand exactly one job to an idle worker.
#[derive(Debug)]
pub struct JobSlot {
    worker_id: usize,
    sender: mpsc::Sender<Job>,
}

impl JobSlot {
    pub(crate) fn new(worker_id: usize, sender: mpsc::Sender<Job>) -> Self {
        Self { worker_id, sender }
    }

    /// Ordinal of the worker that published this slot.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Forwards `job` into the worker's private channel.
    ///
    /// Returns the job back if the worker exited after publishing the slot.
    pub async fn deliver(self, job: Job) -> Result<(), Job> {
        self.sender.send(job).await.map_err(|e| e.0)
    }
}

/// Producer half, held by workers.
pub type QueueSender = async_channel::Sender<JobSlot>;

/// Consumer half, held by the dispatcher and cloned into every hand-off.
pub type QueueReceiver = async_channel::Receiver<JobSlot>;

/// Why a job could not be handed to a worker.
#[derive(Debug)]
pub enum ClaimError {
    /// Every worker has exited; the job is returned to the caller.
    NoWorkers(Job),
}

/// Creates an availability queue sized for `max_workers` idle slots.
///
/// Each worker holds at most one slot in the queue at a time, so publishing
/// never waits on a queue sized this way.
pub fn availability_queue(max_workers: usize) -> (QueueSender, QueueReceiver) {
    async_channel::bounded(max_workers.max(1))
}

/// Claims the next idle worker and hands `job` to it.
///
/// Suspends while no worker is idle. Slots left behind by workers that have
/// since exited are skipped. Returns the ordinal of the worker that received
/// the job.
pub async fn claim_and_deliver(queue: &QueueReceiver, mut job: Job) -> Result<usize, ClaimError> {
    loop {
        let Ok(slot) = queue.recv().await else {
            return Err(ClaimError::NoWorkers(job));
        };

        let worker_id = slot.worker_id();
        match slot.deliver(job).await {
            Ok(()) => return Ok(worker_id),
            Err(returned) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Skipping stale slot of exited worker {worker_id}");
                job = returned;
            }
        }
    }
}
