//! Collector thread: turns the job queue into size- and time-bounded batches

use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use super::types::{Batch, BatchJob, BatchState};

pub(crate) struct CollectorConfig {
    pub max_batch_size: usize,
    pub batch_timeout: Duration,
    pub idle_backoff: Duration,
}

/// Runs until every job sender is gone and the queue is drained.
///
/// An idle window of `batch_timeout` that yields nothing is followed by a
/// sleep of `idle_backoff`. Once a job arrives the batch stays open for at most
/// `batch_timeout` or until it holds `max_batch_size` jobs.
pub(crate) fn collector_thread(
    job_receiver: Receiver<BatchJob>,
    batch_sender: Sender<Batch>,
    config: CollectorConfig,
) {
    let mut batch_id = 0u64;

    loop {
        let first = match job_receiver.recv_timeout(config.batch_timeout) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => {
                std::thread::sleep(config.idle_backoff);
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        batch_id += 1;
        let mut batch = Batch::collecting(batch_id, config.max_batch_size);
        let deadline = Instant::now() + config.batch_timeout;
        batch.jobs.push(first);

        let closed = fill_batch(&job_receiver, &mut batch, deadline, config.max_batch_size);

        if !send_batch(&batch_sender, batch) || closed {
            break;
        }
    }

    tracing::debug!(batches = batch_id, "collector stopped");
}

/// Pull jobs until the batch is full or the deadline passes. Returns true when
/// the queue is closed and empty.
fn fill_batch(
    job_receiver: &Receiver<BatchJob>,
    batch: &mut Batch,
    deadline: Instant,
    max_batch_size: usize,
) -> bool {
    while batch.len() < max_batch_size {
        // Jobs already queued are taken without waiting on the timer
        if let Ok(job) = job_receiver.try_recv() {
            batch.jobs.push(job);
            continue;
        }

        let wait = deadline.saturating_duration_since(Instant::now());
        if wait.is_zero() {
            return false;
        }
        let timeout = crossbeam_channel::after(wait);

        select! {
            recv(job_receiver) -> msg => {
                match msg {
                    Ok(job) => batch.jobs.push(job),
                    Err(_) => return true,
                }
            }
            recv(timeout) -> _ => return false,
        }
    }

    false
}

fn send_batch(batch_sender: &Sender<Batch>, mut batch: Batch) -> bool {
    if batch.is_empty() {
        return true;
    }

    batch.state = BatchState::Dispatched;
    let (id, size) = (batch.id, batch.len());
    tracing::trace!(batch_id = id, size, "batch dispatched");

    if batch_sender.send(batch).is_err() {
        // Dispatchers are gone; dropping the jobs resolves their handles as dropped
        tracing::error!(batch_id = id, size, "no dispatcher available, batch dropped");
        return false;
    }
    true
}
