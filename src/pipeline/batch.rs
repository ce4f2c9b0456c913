//! Batch summarizer: group analyzed papers and synthesize one report section
//! per group.
//!
//! ```text
//! analyzed ──▶ Batcher (size n, arrival order) ──▶ [llm_workers syntheses] ──▶ publisher
//!                                                          │
//!                                                   ReportSections[index]
//! ```
//!
//! Batch indices are handed out when a batch is formed, so the report orders
//! sections by formation, not by which synthesis returned first. A synthesis
//! that fails after retries leaves a placeholder section and an error record
//! on each member; the members still go on to publication.

use crate::config::ProviderConfig;
use crate::paper::{Paper, ProcessingState, Stage};
use crate::pipeline::executor::{retry, RetryPolicy, StageMetrics};
use crate::pipeline::llm::{ChatRequest, LanguageModel, RequestKind};
use crate::progress::ProgressCallback;
use crate::prompts::{synthesis_prompt, SynthesisEntry, SYNTHESIS_SYSTEM_PROMPT};
use crate::report::{BatchSection, ReportSections, SectionOutcome};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// A formed batch awaiting synthesis.
#[derive(Debug)]
pub struct Batch {
    pub index: usize,
    pub papers: Vec<Paper>,
}

/// Groups papers into fixed-size batches in the order they arrive.
#[derive(Debug)]
pub struct Batcher {
    size: usize,
    next_index: usize,
    pending: Vec<Paper>,
}

impl Batcher {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            next_index: 0,
            pending: Vec::with_capacity(size),
        }
    }

    /// Add a paper; returns the batch it completes, if any.
    pub fn push(&mut self, paper: Paper) -> Option<Batch> {
        self.pending.push(paper);
        (self.pending.len() >= self.size).then(|| self.take())
    }

    /// Flush the partial last batch at end of input.
    pub fn finish(&mut self) -> Option<Batch> {
        (!self.pending.is_empty()).then(|| self.take())
    }

    fn take(&mut self) -> Batch {
        let index = self.next_index;
        self.next_index += 1;
        Batch {
            index,
            papers: std::mem::replace(&mut self.pending, Vec::with_capacity(self.size)),
        }
    }
}

pub struct BatchSummarizer {
    model: Arc<dyn LanguageModel>,
    provider: ProviderConfig,
    language: String,
    batch_size: usize,
    concurrency: usize,
    policy: RetryPolicy,
    sections: Arc<ReportSections>,
    metrics: Arc<StageMetrics>,
    progress: Option<ProgressCallback>,
}

impl BatchSummarizer {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        provider: &ProviderConfig,
        language: &str,
        batch_size: usize,
        concurrency: usize,
        sections: Arc<ReportSections>,
    ) -> Self {
        Self {
            model,
            policy: provider.retry_policy(),
            provider: provider.clone(),
            language: language.to_string(),
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
            sections,
            metrics: Arc::new(StageMetrics::default()),
            progress: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<StageMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn spawn(self, input: UnboundedReceiver<Paper>, forward: UnboundedSender<Paper>) -> JoinHandle<()> {
        tokio::spawn(self.run(input, forward))
    }

    /// Drain `input`, then drop `forward`.
    pub async fn run(self, mut input: UnboundedReceiver<Paper>, forward: UnboundedSender<Paper>) {
        let (batch_tx, batch_rx) = unbounded_channel::<Batch>();

        let former = async {
            let mut batcher = Batcher::new(self.batch_size);
            while let Some(paper) = input.recv().await {
                if let Some(batch) = batcher.push(paper) {
                    let _ = batch_tx.send(batch);
                }
            }
            if let Some(batch) = batcher.finish() {
                let _ = batch_tx.send(batch);
            }
            drop(batch_tx);
        };

        let synthesis = UnboundedReceiverStream::new(batch_rx)
            .map(|batch| self.summarize(batch))
            .buffer_unordered(self.concurrency)
            .for_each(|papers| {
                for paper in papers {
                    if let Err(e) = forward.send(paper) {
                        warn!("summarize stage: receiver for paper {} is gone", e.0.id());
                    }
                }
                futures::future::ready(())
            });

        tokio::join!(former, synthesis);
        debug!("summarize stage drained: {:?}", self.metrics.snapshot());
    }

    async fn summarize(&self, batch: Batch) -> Vec<Paper> {
        let Batch { index, mut papers } = batch;
        let _guard = self.metrics.enter();
        if let Some(cb) = &self.progress {
            for p in &papers {
                cb.on_paper_stage(p.id(), Stage::Summarize);
            }
        }

        let prompt = {
            let entries: Vec<SynthesisEntry<'_>> = papers.iter().map(entry).collect();
            synthesis_prompt(index, &entries, &self.language)
        };
        let label = format!("summarize batch {}", index + 1);
        let result = retry(&self.policy, &label, |_| {
            let request = ChatRequest::new(RequestKind::Synthesize, prompt.clone())
                .system(SYNTHESIS_SYSTEM_PROMPT)
                .tuned(&self.provider);
            async move { self.model.chat(&request).await }
        })
        .await;

        let outcome = match result {
            Ok((reply, attempts)) => {
                self.metrics.add_attempts(attempts);
                self.metrics.record_completed();
                info!("Batch {} summarized ({} papers)", index + 1, papers.len());
                for paper in &mut papers {
                    if let Err(e) = paper.advance(ProcessingState::Summarized) {
                        paper.record_error(Stage::Summarize, e.to_string(), attempts);
                    }
                }
                SectionOutcome::Summarized {
                    markdown: reply.content.trim().to_string(),
                }
            }
            Err(exhausted) => {
                self.metrics.add_attempts(exhausted.attempts);
                self.metrics.record_failed();
                warn!(
                    "Batch {} synthesis failed after {} attempt(s): {}",
                    index + 1,
                    exhausted.attempts,
                    exhausted.error
                );
                let message = format!("batch {} synthesis failed: {}", index + 1, exhausted.error);
                for paper in &mut papers {
                    paper.record_error(Stage::Summarize, message.clone(), exhausted.attempts);
                }
                SectionOutcome::Failed {
                    error: exhausted.error.to_string(),
                    attempts: exhausted.attempts,
                }
            }
        };

        self.sections.insert(BatchSection {
            index,
            paper_ids: papers.iter().map(|p| p.id().to_string()).collect(),
            titles: papers.iter().map(|p| p.title().to_string()).collect(),
            outcome,
        });
        papers
    }
}

fn entry(paper: &Paper) -> SynthesisEntry<'_> {
    let analysis = paper.analysis.as_ref();
    let title = analysis
        .map(|a| a.title.as_str())
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(paper.title());
    SynthesisEntry {
        title,
        category: paper.category().unwrap_or("Other"),
        summary: paper.verdict.as_ref().map(|v| v.summary.as_str()).unwrap_or(""),
        contributions: analysis.map(|a| a.core_contributions.as_slice()).unwrap_or(&[]),
    }
}
