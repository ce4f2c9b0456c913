//! Bounded-concurrency stage runner shared by every paper-level stage.
//!
//! A stage is a [`StageOperation`]: an async `process` that may fail, and an
//! `apply` that folds the result into the paper. [`StageExecutor`] reads
//! papers from an input channel, keeps at most `k` operations in flight
//! (`buffer_unordered`), and routes each paper the moment it finishes:
//!
//! ```text
//!             ┌──────── forward ──▶ next stage
//! input ──▶ [k workers] ── retire ──▶ rejected sink
//!             └──────── failed ───▶ failure sink
//! ```
//!
//! Every call goes through [`retry`], which makes up to
//! `RetryPolicy::max_attempts` attempts in total with a fixed delay, but only
//! for errors the policy classifies as retryable. When the input channel
//! closes and the last in-flight paper has been routed, the executor drops
//! its senders so the next stage observes end-of-stream.

use crate::error::StageError;
use crate::paper::{Paper, Stage};
use crate::progress::ProgressCallback;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

// ── Retry ────────────────────────────────────────────────────────────────

type RetryPredicate = Arc<dyn Fn(&StageError) -> bool + Send + Sync>;

/// Attempt budget, fixed delay and retryability test for one kind of call.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first included. Always ≥ 1.
    pub max_attempts: u32,
    pub delay: Duration,
    is_retryable: RetryPredicate,
}

impl RetryPolicy {
    /// Retry transient errors up to `max_attempts` attempts in total.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            is_retryable: Arc::new(StageError::is_transient),
        }
    }

    /// One attempt, no retry.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Replace the retryability test.
    pub fn retry_when(mut self, f: impl Fn(&StageError) -> bool + Send + Sync + 'static) -> Self {
        self.is_retryable = Arc::new(f);
        self
    }

    /// Additionally retry local I/O errors.
    pub fn also_retry_io(self) -> Self {
        let base = Arc::clone(&self.is_retryable);
        self.retry_when(move |e| e.is_io() || base(e))
    }

    pub fn should_retry(&self, err: &StageError) -> bool {
        (self.is_retryable)(err)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

/// Error returned by [`retry`] once the budget is spent or the error is terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct Exhausted {
    pub error: StageError,
    /// Attempts actually made, the failing one included.
    pub attempts: u32,
}

/// Run `op` under `policy`. `op` receives the 1-based attempt number.
///
/// Returns the value together with the number of attempts it took.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<(T, u32), Exhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(error) => {
                if attempt >= policy.max_attempts || !policy.should_retry(&error) {
                    return Err(Exhausted {
                        error,
                        attempts: attempt,
                    });
                }
                warn!(
                    "{}: attempt {}/{} failed, retrying in {:?}: {}",
                    label, attempt, policy.max_attempts, policy.delay, error
                );
                sleep(policy.delay).await;
            }
        }
    }
}

// ── Metrics ──────────────────────────────────────────────────────────────

/// Live counters for one stage. Shared with the coordinator.
#[derive(Debug, Default)]
pub struct StageMetrics {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    attempts: AtomicU64,
    completed: AtomicUsize,
    retired: AtomicUsize,
    failed: AtomicUsize,
}

/// Point-in-time copy of [`StageMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub attempts: u64,
    pub completed: usize,
    pub retired: usize,
    pub failed: usize,
}

impl StageMetrics {
    /// Count one operation in flight until the guard drops.
    pub fn enter(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { metrics: self }
    }

    pub fn add_attempts(&self, n: u32) {
        self.attempts.fetch_add(u64::from(n), Ordering::SeqCst);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_retired(&self) {
        self.retired.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StageStats {
        StageStats {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            attempts: self.attempts.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            retired: self.retired.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

pub struct InFlightGuard<'a> {
    metrics: &'a StageMetrics,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Stage operation ──────────────────────────────────────────────────────

/// What happens to a paper after a successful `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Hand on to the next stage.
    Forward,
    /// Terminal without failure (rejected by the filter).
    Retire,
}

/// One paper-level pipeline step.
#[async_trait]
pub trait StageOperation: Send + Sync + 'static {
    type Output: Send + 'static;

    fn stage(&self) -> Stage;

    /// Do the work. Called once per attempt; must not mutate the paper.
    async fn process(&self, paper: &Paper) -> Result<Self::Output, StageError>;

    /// Fold a successful output into the paper and advance its state.
    fn apply(&self, paper: &mut Paper, output: Self::Output) -> Result<Route, StageError>;
}

/// Where a stage sends papers once it is done with them.
#[derive(Debug, Clone)]
pub struct StageSinks {
    pub forward: UnboundedSender<Paper>,
    pub retired: UnboundedSender<Paper>,
    pub failed: UnboundedSender<Paper>,
}

enum Outcome {
    Routed(Route),
    Failed,
}

/// Runs one [`StageOperation`] over a channel of papers.
pub struct StageExecutor<O: StageOperation> {
    op: Arc<O>,
    concurrency: usize,
    policy: RetryPolicy,
    metrics: Arc<StageMetrics>,
    progress: Option<ProgressCallback>,
}

impl<O: StageOperation> StageExecutor<O> {
    pub fn new(op: Arc<O>, concurrency: usize, policy: RetryPolicy) -> Self {
        Self {
            op,
            concurrency: concurrency.max(1),
            policy,
            metrics: Arc::new(StageMetrics::default()),
            progress: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<StageMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn metrics(&self) -> Arc<StageMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run on its own task.
    pub fn spawn(self, input: UnboundedReceiver<Paper>, sinks: StageSinks) -> JoinHandle<()> {
        tokio::spawn(self.run(input, sinks))
    }

    /// Drain `input`, then drop `sinks`.
    pub async fn run(self, input: UnboundedReceiver<Paper>, sinks: StageSinks) {
        let stage = self.op.stage();
        debug!("{} stage started with {} workers", stage, self.concurrency);

        UnboundedReceiverStream::new(input)
            .map(|paper| self.process_one(paper))
            .buffer_unordered(self.concurrency)
            .for_each(|(paper, outcome)| {
                self.route(paper, outcome, &sinks);
                futures::future::ready(())
            })
            .await;

        debug!("{} stage drained: {:?}", stage, self.metrics.snapshot());
    }

    async fn process_one(&self, mut paper: Paper) -> (Paper, Outcome) {
        let stage = self.op.stage();
        let _guard = self.metrics.enter();
        if let Some(cb) = &self.progress {
            cb.on_paper_stage(paper.id(), stage);
        }

        let label = format!("{} {}", stage, paper.id());
        let result = {
            let op = &self.op;
            let paper_ref = &paper;
            retry(&self.policy, &label, move |_| {
                // A panicking worker fails its own paper, not the stage.
                AssertUnwindSafe(op.process(paper_ref))
                    .catch_unwind()
                    .map(move |r| r.unwrap_or_else(|_| Err(StageError::Internal(format!("{stage} worker panicked")))))
            })
            .await
        };

        let outcome = match result {
            Ok((output, attempts)) => {
                self.metrics.add_attempts(attempts);
                match self.op.apply(&mut paper, output) {
                    Ok(route) => Outcome::Routed(route),
                    Err(e) => {
                        paper.fail(stage, e.to_string(), attempts);
                        Outcome::Failed
                    }
                }
            }
            Err(Exhausted { error, attempts }) => {
                self.metrics.add_attempts(attempts);
                warn!("{}: failed after {} attempt(s): {}", label, attempts, error);
                paper.fail(stage, error.to_string(), attempts);
                Outcome::Failed
            }
        };
        (paper, outcome)
    }

    fn route(&self, paper: Paper, outcome: Outcome, sinks: &StageSinks) {
        let stage = self.op.stage();
        let sent = match outcome {
            Outcome::Routed(Route::Forward) => {
                self.metrics.record_completed();
                sinks.forward.send(paper)
            }
            Outcome::Routed(Route::Retire) => {
                self.metrics.record_retired();
                if let Some(cb) = &self.progress {
                    cb.on_paper_done(paper.id(), paper.state());
                }
                sinks.retired.send(paper)
            }
            Outcome::Failed => {
                self.metrics.record_failed();
                if let Some(cb) = &self.progress {
                    let msg = paper.last_error().map(|e| e.message.as_str()).unwrap_or("");
                    cb.on_paper_failed(paper.id(), stage, msg);
                }
                sinks.failed.send(paper)
            }
        };
        if let Err(e) = sent {
            warn!("{} stage: receiver for paper {} is gone", stage, e.0.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{PaperMeta, ProcessingState};
    use std::sync::Mutex;
    use tokio::sync::mpsc::unbounded_channel;

    fn paper(id: &str) -> Paper {
        Paper::new(PaperMeta::new(id, format!("Paper {id}")))
    }

    fn transient() -> StageError {
        StageError::Transient {
            provider: "test".into(),
            detail: "503".into(),
        }
    }

    #[tokio::test]
    async fn retry_counts_attempts_until_success() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let (value, attempts) = retry(&policy, "t", |n| async move {
            if n < 3 {
                Err(transient())
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn retry_stops_at_exact_budget() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let err = retry(&policy, "t", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(transient()) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let err = retry(&policy, "t", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(StageError::MalformedResponse("not json".into())) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn custom_predicate_widens_retry() {
        let policy = RetryPolicy::new(2, Duration::ZERO).also_retry_io();
        let err = retry(&policy, "t", |_| async {
            Err::<(), _>(StageError::Io {
                path: "/x".into(),
                detail: "full".into(),
            })
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 2);
    }

    // Sleeps, tracks its own concurrency, fails ids starting with "bad".
    struct SlowOp {
        current: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<String>>,
    }

    impl SlowOp {
        fn new() -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StageOperation for SlowOp {
        type Output = ();

        fn stage(&self) -> Stage {
            Stage::Download
        }

        async fn process(&self, paper: &Paper) -> Result<(), StageError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push(paper.id().to_string());
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            if paper.id().starts_with("bad") {
                Err(transient())
            } else if paper.id().starts_with("panic") {
                panic!("worker exploded");
            } else {
                Ok(())
            }
        }

        fn apply(&self, paper: &mut Paper, _: ()) -> Result<Route, StageError> {
            paper
                .advance(ProcessingState::Downloaded)
                .map_err(|e| StageError::InvalidTransition(e.to_string()))?;
            Ok(Route::Forward)
        }
    }

    fn accepted(id: &str) -> Paper {
        let mut p = paper(id);
        p.advance(ProcessingState::Filtered { accepted: true }).unwrap();
        p
    }

    async fn drive(op: Arc<SlowOp>, k: usize, attempts: u32, papers: Vec<Paper>) -> (Vec<Paper>, Vec<Paper>, StageStats) {
        let (in_tx, in_rx) = unbounded_channel();
        let (fwd_tx, mut fwd_rx) = unbounded_channel();
        let (ret_tx, _ret_rx) = unbounded_channel();
        let (fail_tx, mut fail_rx) = unbounded_channel();
        for p in papers {
            in_tx.send(p).unwrap();
        }
        drop(in_tx);

        let exec = StageExecutor::new(op, k, RetryPolicy::new(attempts, Duration::ZERO));
        let metrics = exec.metrics();
        exec.spawn(
            in_rx,
            StageSinks {
                forward: fwd_tx,
                retired: ret_tx,
                failed: fail_tx,
            },
        )
        .await
        .unwrap();

        let mut forwarded = Vec::new();
        while let Some(p) = fwd_rx.recv().await {
            forwarded.push(p);
        }
        let mut failed = Vec::new();
        while let Some(p) = fail_rx.recv().await {
            failed.push(p);
        }
        (forwarded, failed, metrics.snapshot())
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_limit() {
        let op = Arc::new(SlowOp::new());
        let papers = (0..20).map(|i| accepted(&format!("p{i}"))).collect();
        let (forwarded, failed, stats) = drive(Arc::clone(&op), 3, 1, papers).await;

        assert_eq!(forwarded.len(), 20);
        assert!(failed.is_empty());
        assert!(stats.peak_in_flight <= 3, "peak {}", stats.peak_in_flight);
        assert!(op.peak.load(Ordering::SeqCst) <= 3);
        assert!(stats.peak_in_flight >= 2, "load never overlapped");
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.completed, 20);
    }

    #[tokio::test]
    async fn exhausted_paper_fails_with_exact_attempts_and_siblings_continue() {
        let op = Arc::new(SlowOp::new());
        let papers = vec![accepted("ok1"), accepted("bad1"), accepted("ok2")];
        let (forwarded, failed, stats) = drive(Arc::clone(&op), 2, 4, papers).await;

        assert_eq!(forwarded.len(), 2);
        assert_eq!(failed.len(), 1);
        let bad = &failed[0];
        assert_eq!(bad.state(), ProcessingState::Failed(Stage::Download));
        let record = bad.last_error().unwrap();
        assert_eq!(record.stage, Stage::Download);
        assert_eq!(record.attempts, 4);

        let bad_calls = op.calls.lock().unwrap().iter().filter(|id| *id == "bad1").count();
        assert_eq!(bad_calls, 4);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.attempts, 6);
    }

    #[tokio::test]
    async fn panicking_worker_fails_only_its_paper() {
        let op = Arc::new(SlowOp::new());
        let papers = vec![accepted("panic1"), accepted("ok1")];
        let (forwarded, failed, _) = drive(op, 2, 1, papers).await;
        assert_eq!(forwarded.len(), 1);
        assert_eq!(failed.len(), 1);
        assert!(failed[0].last_error().unwrap().message.contains("panicked"));
    }

    #[tokio::test]
    async fn apply_rejecting_regression_fails_paper() {
        let op = Arc::new(SlowOp::new());
        let mut published = accepted("p1");
        published.advance(ProcessingState::Published).unwrap();
        let (forwarded, failed, _) = drive(op, 1, 1, vec![published]).await;
        assert!(forwarded.is_empty());
        // Already terminal: the state stays Published, the history records the attempt.
        assert_eq!(failed[0].state(), ProcessingState::Published);
        assert!(failed[0].last_error().unwrap().message.contains("cannot move"));
    }
}
