//! Progress-callback trait for per-paper pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::run::PipelineBuilder::progress`] to receive events as papers move
//! through the stages.
//!
//! # Example
//!
//! ```rust
//! use paper_digest::{PipelineProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     failed: Arc<AtomicUsize>,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_paper_failed(&self, id: &str, stage: Stage, error: &str) {
//!         self.failed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{id} failed at {stage}: {error}");
//!     }
//! }
//!
//! let cb: Arc<dyn PipelineProgressCallback> = Arc::new(CountingCallback {
//!     failed: Arc::new(AtomicUsize::new(0)),
//! });
//! cb.on_paper_failed("2405.00001", Stage::Download, "HTTP 404");
//! ```

use crate::output::RunStats;
use crate::paper::{ProcessingState, Stage};
use crate::run::RunPhase;
use std::sync::Arc;

/// Called by the pipeline as papers move through the stages.
///
/// Implementations must be `Send + Sync`: every stage runs its own worker
/// pool, so `on_paper_stage`, `on_paper_failed` and `on_paper_done` may be
/// called concurrently. All methods have no-op defaults.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once, after deduplication, before any stage starts.
    fn on_run_start(&self, total_papers: usize) {
        let _ = total_papers;
    }

    /// Called when the coordinator enters a new phase.
    fn on_phase(&self, phase: RunPhase) {
        let _ = phase;
    }

    /// Called when a stage picks a paper up.
    fn on_paper_stage(&self, id: &str, stage: Stage) {
        let _ = (id, stage);
    }

    /// Called when a paper exhausts its retries at a stage.
    fn on_paper_failed(&self, id: &str, stage: Stage, error: &str) {
        let _ = (id, stage, error);
    }

    /// Called when a paper reaches a terminal state other than failure.
    fn on_paper_done(&self, id: &str, state: ProcessingState) {
        let _ = (id, state);
    }

    /// Called once after the report has been published.
    fn on_run_complete(&self, stats: &RunStats) {
        let _ = stats;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        total: AtomicUsize,
        stages: AtomicUsize,
        failures: AtomicUsize,
        done: AtomicUsize,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_run_start(&self, total_papers: usize) {
            self.total.store(total_papers, Ordering::SeqCst);
        }

        fn on_paper_stage(&self, _id: &str, _stage: Stage) {
            self.stages.fetch_add(1, Ordering::SeqCst);
        }

        fn on_paper_failed(&self, _id: &str, _stage: Stage, _error: &str) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        fn on_paper_done(&self, _id: &str, _state: ProcessingState) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(5);
        cb.on_phase(RunPhase::Filtering);
        cb.on_paper_stage("a", Stage::Filter);
        cb.on_paper_failed("a", Stage::Download, "404");
        cb.on_paper_done("b", ProcessingState::Published);
        cb.on_run_complete(&RunStats::default());
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_run_start(3);
        tracker.on_paper_stage("a", Stage::Filter);
        tracker.on_paper_stage("b", Stage::Filter);
        tracker.on_paper_failed("b", Stage::Filter, "malformed");
        tracker.on_paper_done("a", ProcessingState::Published);

        assert_eq!(tracker.total.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.stages.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.failures.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_run_start(10);
        cb.on_paper_stage("x", Stage::Ocr);
    }
}
