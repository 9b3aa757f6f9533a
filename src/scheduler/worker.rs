//! Dispatcher threads: one model call per batch, then per-job resolution

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::types::{Batch, BatchJob, BatchState, JobOutcome};
use crate::error_handling::ScoringFailure;
use crate::model::{EncodedInput, InferenceOutput, ScoringModel};
use crate::stats::StatsAggregator;

#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub model: Arc<dyn ScoringModel>,
    pub stats: Arc<StatsAggregator>,
    pub threshold: f32,
    pub inference_timeout: Option<Duration>,
}

pub(crate) fn dispatcher_thread(
    worker_id: usize,
    batch_receiver: Receiver<Batch>,
    ctx: DispatchContext,
) {
    let mut handled = 0usize;
    let mut runner = InferenceRunner::new(worker_id, &ctx);
    while let Ok(batch) = batch_receiver.recv() {
        dispatch_batch(batch, &ctx, &mut runner);
        handled += 1;
    }
    tracing::debug!(worker_id, batches = handled, "dispatcher stopped");
}

pub(crate) fn dispatch_batch(
    batch: Batch,
    ctx: &DispatchContext,
    runner: &mut InferenceRunner,
) -> BatchState {
    let Batch { id, jobs, .. } = batch;
    let size = jobs.len();

    let (inputs, pending): (Vec<EncodedInput>, Vec<PendingJob>) = jobs
        .into_iter()
        .map(|job| {
            let BatchJob {
                sequence,
                input,
                received_at,
                reply,
            } = job;
            (
                input,
                PendingJob {
                    sequence,
                    received_at,
                    reply,
                },
            )
        })
        .unzip();

    let result = runner.run(inputs).and_then(|output| validate_output(output, size));

    let state = match result {
        Ok(output) => {
            for (position, job) in pending.into_iter().enumerate() {
                let outcome = JobOutcome::scored(
                    job.sequence,
                    id,
                    output.anomaly_scores[position],
                    output.confidences[position],
                    ctx.threshold,
                    job.received_at.elapsed(),
                );
                resolve(job, outcome, ctx);
            }
            BatchState::Completed
        }
        Err(failure) => {
            tracing::warn!(batch_id = id, size, error = %failure, "batch failed, resolving neutral");
            for job in pending {
                let outcome = JobOutcome::neutral(
                    job.sequence,
                    id,
                    failure.clone(),
                    job.received_at.elapsed(),
                );
                resolve(job, outcome, ctx);
            }
            BatchState::Failed
        }
    };

    ctx.stats.record_batch(state == BatchState::Completed);
    tracing::trace!(batch_id = id, size, state = ?state, "batch resolved");
    state
}

struct PendingJob {
    sequence: u64,
    received_at: std::time::Instant,
    reply: crossbeam_channel::Sender<JobOutcome>,
}

fn resolve(job: PendingJob, outcome: JobOutcome, ctx: &DispatchContext) {
    ctx.stats
        .record_request(outcome.latency, outcome.is_anomalous, outcome.is_neutral());
    // A dropped handle means the caller stopped waiting
    let _ = job.reply.send(outcome);
}

/// Model calls for one dispatcher.
///
/// Without a deadline the model runs inline. With one, calls go to a single
/// long-lived helper thread; at most one call per dispatcher outlives its
/// deadline, and while it does every batch on that dispatcher resolves neutral.
pub(crate) struct InferenceRunner {
    worker_id: usize,
    model: Arc<dyn ScoringModel>,
    deadline: Option<Duration>,
    helper: Option<DeadlineHelper>,
}

impl InferenceRunner {
    pub(crate) fn new(worker_id: usize, ctx: &DispatchContext) -> Self {
        Self {
            worker_id,
            model: Arc::clone(&ctx.model),
            deadline: ctx.inference_timeout,
            helper: None,
        }
    }

    fn run(&mut self, inputs: Vec<EncodedInput>) -> Result<InferenceOutput, ScoringFailure> {
        let Some(deadline) = self.deadline else {
            return guarded_infer(self.model.as_ref(), &inputs);
        };

        let mut helper = match self.helper.take() {
            Some(helper) => helper,
            None => DeadlineHelper::spawn(self.worker_id, Arc::clone(&self.model))?,
        };
        let result = helper.call(inputs, deadline);
        // A helper that went away is replaced on the next call
        if !helper.lost {
            self.helper = Some(helper);
        }
        result
    }
}

type InferenceResult = Result<InferenceOutput, ScoringFailure>;

struct DeadlineHelper {
    worker_id: usize,
    requests: Sender<Vec<EncodedInput>>,
    results: Receiver<InferenceResult>,
    /// A call that missed its deadline is still running
    stalled: bool,
    lost: bool,
}

impl DeadlineHelper {
    fn spawn(worker_id: usize, model: Arc<dyn ScoringModel>) -> Result<Self, ScoringFailure> {
        let (request_tx, request_rx) = bounded::<Vec<EncodedInput>>(1);
        let (result_tx, result_rx) = bounded::<InferenceResult>(1);

        thread::Builder::new()
            .name(format!("reqscore-infer-{worker_id}"))
            .spawn(move || {
                for inputs in request_rx {
                    if result_tx.send(guarded_infer(model.as_ref(), &inputs)).is_err() {
                        break;
                    }
                }
            })
            .map_err(|err| ScoringFailure::Model(format!("failed to start inference thread: {err}")))?;

        Ok(Self {
            worker_id,
            requests: request_tx,
            results: result_rx,
            stalled: false,
            lost: false,
        })
    }

    fn call(&mut self, inputs: Vec<EncodedInput>, deadline: Duration) -> InferenceResult {
        if self.stalled {
            match self.results.try_recv() {
                // Late result of a batch that was already resolved neutral
                Ok(_) => {
                    self.stalled = false;
                    tracing::info!(worker_id = self.worker_id, "inference helper recovered");
                }
                Err(TryRecvError::Empty) => return Err(ScoringFailure::DeadlineExceeded(deadline)),
                Err(TryRecvError::Disconnected) => return Err(self.mark_lost()),
            }
        }

        if self.requests.send(inputs).is_err() {
            return Err(self.mark_lost());
        }

        match self.results.recv_timeout(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.stalled = true;
                tracing::warn!(
                    worker_id = self.worker_id,
                    deadline_ms = deadline.as_millis() as u64,
                    "inference missed its deadline; dispatcher resolves neutral until it returns"
                );
                Err(ScoringFailure::DeadlineExceeded(deadline))
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.mark_lost()),
        }
    }

    fn mark_lost(&mut self) -> ScoringFailure {
        self.lost = true;
        ScoringFailure::Panicked
    }
}

fn guarded_infer(
    model: &dyn ScoringModel,
    inputs: &[EncodedInput],
) -> Result<InferenceOutput, ScoringFailure> {
    match panic::catch_unwind(AssertUnwindSafe(|| model.infer(inputs))) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(ScoringFailure::Model(format!("{err:#}"))),
        Err(_) => Err(ScoringFailure::Panicked),
    }
}

fn validate_output(output: InferenceOutput, expected: usize) -> Result<InferenceOutput, ScoringFailure> {
    if output.anomaly_scores.len() != expected || output.confidences.len() != expected {
        return Err(ScoringFailure::OutputMismatch {
            expected,
            scores: output.anomaly_scores.len(),
            confidences: output.confidences.len(),
        });
    }

    let invalid = output
        .anomaly_scores
        .iter()
        .chain(&output.confidences)
        .enumerate()
        .find(|(_, value)| !value.is_finite() || !(0.0..=1.0).contains(*value));

    if let Some((index, &value)) = invalid {
        return Err(ScoringFailure::InvalidScore {
            position: index % expected.max(1),
            value,
        });
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use crossbeam_channel::Receiver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct FixedModel(Vec<f32>);

    impl ScoringModel for FixedModel {
        fn encode(&self, _tokens: &[String], max_length: usize) -> EncodedInput {
            EncodedInput {
                token_ids: vec![0; max_length],
                attention_mask: vec![0; max_length],
            }
        }

        fn infer(&self, batch: &[EncodedInput]) -> Result<InferenceOutput> {
            if batch.len() != self.0.len() {
                bail!("unexpected batch size {}", batch.len());
            }
            Ok(InferenceOutput {
                anomaly_scores: self.0.clone(),
                confidences: self.0.iter().map(|s| (s - 0.5).abs() * 2.0).collect(),
            })
        }
    }

    fn batch_of(n: usize) -> (Batch, Vec<Receiver<JobOutcome>>) {
        let mut batch = Batch::collecting(9, n);
        let mut receivers = Vec::new();
        for sequence in 0..n as u64 {
            let (reply, rx) = bounded(1);
            batch.jobs.push(BatchJob {
                sequence,
                input: EncodedInput {
                    token_ids: vec![1],
                    attention_mask: vec![1],
                },
                received_at: Instant::now(),
                reply,
            });
            receivers.push(rx);
        }
        (batch, receivers)
    }

    fn dispatch(batch: Batch, ctx: &DispatchContext) -> BatchState {
        dispatch_batch(batch, ctx, &mut InferenceRunner::new(0, ctx))
    }

    fn ctx(model: impl ScoringModel + 'static) -> DispatchContext {
        DispatchContext {
            model: Arc::new(model),
            stats: Arc::new(StatsAggregator::new()),
            threshold: 0.5,
            inference_timeout: None,
        }
    }

    #[test]
    fn resolves_in_batch_position_order() {
        let ctx = ctx(FixedModel(vec![0.1, 0.9, 0.5]));
        let (batch, receivers) = batch_of(3);

        assert_eq!(dispatch(batch, &ctx), BatchState::Completed);

        let outcomes: Vec<JobOutcome> = receivers.iter().map(|rx| rx.recv().unwrap()).collect();
        assert_eq!(outcomes[0].anomaly_score, 0.1);
        assert!(outcomes[1].is_anomalous);
        assert!(!outcomes[2].is_anomalous);
        assert!(outcomes.iter().all(|o| o.batch_id == 9 && !o.is_neutral()));

        let snapshot = ctx.stats.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.anomalous_requests, 1);
        assert_eq!(snapshot.batches_completed, 1);
    }

    #[test]
    fn length_mismatch_fails_whole_batch() {
        let ctx = ctx(FixedModel(vec![0.9, 0.9]));
        let (batch, receivers) = batch_of(3);

        assert_eq!(dispatch(batch, &ctx), BatchState::Failed);
        for rx in receivers {
            let outcome = rx.recv().unwrap();
            assert_eq!(outcome.anomaly_score, 0.0);
            assert_eq!(outcome.confidence, 0.0);
            assert!(!outcome.is_anomalous);
            assert!(outcome.is_neutral());
        }
        assert_eq!(ctx.stats.snapshot().failed_requests, 3);
    }

    #[test]
    fn out_of_range_score_is_rejected() {
        let output = InferenceOutput {
            anomaly_scores: vec![0.2, f32::NAN],
            confidences: vec![0.6, 0.1],
        };
        assert!(matches!(
            validate_output(output, 2),
            Err(ScoringFailure::InvalidScore { position: 1, .. })
        ));

        let output = InferenceOutput {
            anomaly_scores: vec![0.2, 0.3],
            confidences: vec![0.6, 1.5],
        };
        assert!(matches!(
            validate_output(output, 2),
            Err(ScoringFailure::InvalidScore { position: 1, .. })
        ));
    }

    #[test]
    fn cancelled_handles_do_not_break_resolution() {
        let ctx = ctx(FixedModel(vec![0.7, 0.2]));
        let (batch, mut receivers) = batch_of(2);
        drop(receivers.remove(0));

        assert_eq!(dispatch(batch, &ctx), BatchState::Completed);
        assert_eq!(receivers[0].recv().unwrap().anomaly_score, 0.2);
    }

    /// Blocks in `infer` until released, counting calls that reached the model
    struct StuckModel {
        calls: AtomicUsize,
        release: Receiver<()>,
    }

    impl ScoringModel for StuckModel {
        fn encode(&self, _tokens: &[String], max_length: usize) -> EncodedInput {
            EncodedInput {
                token_ids: vec![0; max_length],
                attention_mask: vec![0; max_length],
            }
        }

        fn infer(&self, batch: &[EncodedInput]) -> Result<InferenceOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.release.recv();
            Ok(InferenceOutput {
                anomaly_scores: vec![0.9; batch.len()],
                confidences: vec![0.8; batch.len()],
            })
        }
    }

    #[test]
    fn stalled_helper_is_not_given_more_work() {
        let (release_tx, release_rx) = bounded::<()>(0);
        let model = Arc::new(StuckModel {
            calls: AtomicUsize::new(0),
            release: release_rx,
        });
        let ctx = DispatchContext {
            model: Arc::clone(&model) as Arc<dyn ScoringModel>,
            stats: Arc::new(StatsAggregator::new()),
            threshold: 0.5,
            inference_timeout: Some(Duration::from_millis(10)),
        };
        let mut runner = InferenceRunner::new(0, &ctx);

        for _ in 0..5 {
            let (batch, receivers) = batch_of(1);
            assert_eq!(dispatch_batch(batch, &ctx, &mut runner), BatchState::Failed);
            assert_eq!(
                receivers[0].recv().unwrap().failure,
                Some(ScoringFailure::DeadlineExceeded(Duration::from_millis(10)))
            );
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);

        // Unblock the stuck call; its late result is discarded and the helper reused
        drop(release_tx);
        let started = Instant::now();
        loop {
            let (batch, receivers) = batch_of(1);
            if dispatch_batch(batch, &ctx, &mut runner) == BatchState::Completed {
                assert!(receivers[0].recv().unwrap().is_anomalous);
                break;
            }
            assert!(started.elapsed() < Duration::from_secs(5), "helper never recovered");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }
}
