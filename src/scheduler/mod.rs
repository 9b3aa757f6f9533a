//! Adaptive micro-batching in front of a scoring model
//!
//! # Module Structure
//!
//! - `types`: configuration, jobs, batches, outcomes and completion handles
//! - `batching`: collector thread assembling batches from the bounded queue
//! - `worker`: dispatcher threads calling the model and resolving jobs

mod batching;
mod types;
mod worker;

pub use types::{BatchState, CompletionHandle, JobOutcome, SchedulerConfig};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::error_handling::SubmitError;
use crate::model::{EncodedInput, ScoringModel};
use crate::stats::StatsAggregator;
use batching::{collector_thread, CollectorConfig};
use types::BatchJob;
use worker::{dispatcher_thread, DispatchContext};

/// Bounded queue + collector + dispatcher pool.
///
/// `submit` never blocks. Shutdown stops intake, flushes every queued job
/// through the model and joins all threads.
pub struct BatchScheduler {
    config: SchedulerConfig,
    job_sender: RwLock<Option<Sender<BatchJob>>>,
    next_sequence: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<StatsAggregator>,
}

impl BatchScheduler {
    pub fn start(
        config: SchedulerConfig,
        model: Arc<dyn ScoringModel>,
        stats: Arc<StatsAggregator>,
    ) -> Result<Self> {
        config.validate()?;

        let (job_sender, job_receiver) = bounded(config.queue_capacity);
        // Rendezvous: a batch leaves the collector only when a dispatcher is free
        let (batch_sender, batch_receiver) = bounded(0);

        let mut threads = Vec::with_capacity(config.dispatch_workers + 1);

        let collector_config = CollectorConfig {
            max_batch_size: config.max_batch_size,
            batch_timeout: config.batch_timeout,
            idle_backoff: config.idle_backoff,
        };
        threads.push(
            thread::Builder::new()
                .name("reqscore-collector".to_string())
                .spawn(move || collector_thread(job_receiver, batch_sender, collector_config))
                .context("Failed to spawn batch collector thread")?,
        );

        let ctx = DispatchContext {
            model,
            stats: Arc::clone(&stats),
            threshold: config.threshold,
            inference_timeout: config.inference_timeout,
        };
        for worker_id in 0..config.dispatch_workers {
            let batch_receiver = batch_receiver.clone();
            let ctx = ctx.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("reqscore-dispatch-{worker_id}"))
                    .spawn(move || dispatcher_thread(worker_id, batch_receiver, ctx))
                    .with_context(|| format!("Failed to spawn dispatcher thread {worker_id}"))?,
            );
        }

        tracing::debug!(
            max_batch_size = config.max_batch_size,
            batch_timeout_ms = config.batch_timeout.as_millis() as u64,
            queue_capacity = config.queue_capacity,
            dispatch_workers = config.dispatch_workers,
            "scheduler started"
        );

        Ok(Self {
            config,
            job_sender: RwLock::new(Some(job_sender)),
            next_sequence: AtomicU64::new(1),
            threads: Mutex::new(threads),
            stats,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn submit(&self, input: EncodedInput) -> Result<CompletionHandle, SubmitError> {
        self.submit_at(input, Instant::now())
    }

    /// Submit with an earlier receipt instant so latency covers caller-side work
    pub fn submit_at(
        &self,
        input: EncodedInput,
        received_at: Instant,
    ) -> Result<CompletionHandle, SubmitError> {
        let guard = self.job_sender.read().map_err(|_| SubmitError::Closed)?;
        let sender = guard.as_ref().ok_or(SubmitError::Closed)?;

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = bounded(1);
        let job = BatchJob {
            sequence,
            input,
            received_at,
            reply,
        };

        match sender.try_send(job) {
            Ok(()) => Ok(CompletionHandle::new(sequence, receiver)),
            Err(TrySendError::Full(_)) => Err(SubmitError::Backpressure {
                capacity: self.config.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::Closed),
        }
    }

    /// Jobs waiting in the queue (not yet collected)
    pub fn queued(&self) -> usize {
        self.job_sender
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(Sender::len))
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.job_sender
            .read()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }

    /// Stop intake, drain queued jobs into final batches and join every thread.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.job_sender.write() {
            sender.take();
        }

        let handles = match self.threads.lock() {
            Ok(mut threads) => std::mem::take(&mut *threads),
            Err(_) => return,
        };
        if handles.is_empty() {
            return;
        }

        for handle in handles {
            let name = handle.thread().name().unwrap_or("scheduler").to_string();
            if handle.join().is_err() {
                tracing::error!(thread = %name, "scheduler thread panicked");
            }
        }
        tracing::debug!("scheduler stopped");
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
