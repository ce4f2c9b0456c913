//! Run coordinator: wires the stages together and produces the daily report.
//!
//! ```text
//!  papers ─▶ filter ─▶ download ─▶ ocr ─▶ analyze ─▶ batch ─▶ publish ─▶ done
//!              │          │  └──── skip_deep_analysis ───────────┘ ▲       ▲
//!              │          │             analyze ── batching off ───┘       │
//!              └──────────┴── rejected / failed (every stage) ─────────────┘
//! ```
//!
//! Every arrow is an unbounded channel owned by the coordinator. Each stage
//! drops its senders when its input is drained, so the next stage observes
//! end-of-stream; the coordinator joins the stages in order and reports a
//! [`RunPhase`] each time a stage's input queue closes.

use crate::config::{ArtifactErrorPolicy, DigestConfig};
use crate::error::DigestError;
use crate::layout::StorageLayout;
use crate::library::{build_library, CollectionKey, LibraryClient};
use crate::output::{RunOutput, RunStats};
use crate::paper::{Paper, PaperMeta, ProcessingState, Stage};
use crate::pipeline::analyze::AnalyzeStage;
use crate::pipeline::batch::BatchSummarizer;
use crate::pipeline::category::CategoryResolver;
use crate::pipeline::download::{DownloadStage, HttpFetcher, PdfFetcher};
use crate::pipeline::executor::{RetryPolicy, StageExecutor, StageMetrics, StageSinks};
use crate::pipeline::filter::FilterStage;
use crate::pipeline::llm::{build_model, LanguageModel};
use crate::pipeline::ocr::{OcrSettings, OcrStage};
use crate::pipeline::publish::Publisher;
use crate::pipeline::render::{PageRasterizer, PdfiumRasterizer};
use crate::progress::ProgressCallback;
use crate::report::{DailyReport, FailedPaper, ReportSections};
use crate::source::{dates_in_range, PaperSource};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Coordinator phase. Each phase starts when the previous stage's input
/// queue has closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Scraping,
    Filtering,
    Downloading,
    Recognizing,
    Analyzing,
    Summarizing,
    Publishing,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Scraping => "scraping",
            RunPhase::Filtering => "filtering",
            RunPhase::Downloading => "downloading",
            RunPhase::Recognizing => "recognizing",
            RunPhase::Analyzing => "analyzing",
            RunPhase::Summarizing => "summarizing",
            RunPhase::Publishing => "publishing",
            RunPhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Builder for [`Pipeline`]. Every seam defaults to its production
/// implementation; tests swap in fakes.
pub struct PipelineBuilder {
    config: DigestConfig,
    llm: Option<Arc<dyn LanguageModel>>,
    ocr_model: Option<Arc<dyn LanguageModel>>,
    fetcher: Option<Arc<dyn PdfFetcher>>,
    rasterizer: Option<Arc<dyn PageRasterizer>>,
    library: Option<Arc<dyn LibraryClient>>,
    progress: Option<ProgressCallback>,
}

impl PipelineBuilder {
    pub fn new(config: DigestConfig) -> Self {
        Self {
            config,
            llm: None,
            ocr_model: None,
            fetcher: None,
            rasterizer: None,
            library: None,
            progress: None,
        }
    }

    /// Model used for classification, analysis and batch synthesis.
    pub fn llm(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(model);
        self
    }

    /// Vision model used for page OCR.
    pub fn ocr_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.ocr_model = Some(model);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn PdfFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn rasterizer(mut self, rasterizer: Arc<dyn PageRasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    pub fn library(mut self, library: Arc<dyn LibraryClient>) -> Self {
        self.library = Some(library);
        self
    }

    pub fn progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Validate the configuration and resolve every seam.
    ///
    /// Fails with a run-fatal error before anything is spawned.
    pub fn build(self) -> Result<Pipeline, DigestError> {
        self.config.validate()?;

        let llm = match self.llm {
            Some(model) => model,
            None => build_model("llm", &self.config.llm)?,
        };
        // No vision model is needed when OCR never runs.
        let ocr_model = match self.ocr_model {
            Some(model) => Some(model),
            None if self.config.skip_deep_analysis => None,
            None => Some(build_model("ocr", &self.config.ocr)?),
        };
        let fetcher = match self.fetcher {
            Some(f) => f,
            None => Arc::new(HttpFetcher::new(&self.config.download)?),
        };
        let rasterizer = self.rasterizer.unwrap_or_else(|| Arc::new(PdfiumRasterizer));
        let library = match self.library {
            Some(l) => l,
            None => build_library(&self.config.library)?,
        };

        Ok(Pipeline {
            config: self.config,
            llm,
            ocr_model,
            fetcher,
            rasterizer,
            library,
            progress: self.progress,
        })
    }
}

/// A configured pipeline. Reusable across dates.
pub struct Pipeline {
    config: DigestConfig,
    llm: Arc<dyn LanguageModel>,
    ocr_model: Option<Arc<dyn LanguageModel>>,
    fetcher: Arc<dyn PdfFetcher>,
    rasterizer: Arc<dyn PageRasterizer>,
    library: Arc<dyn LibraryClient>,
    progress: Option<ProgressCallback>,
}

/// Per-stage metrics handles, read once the run has drained.
#[derive(Default)]
struct Meters {
    stages: BTreeMap<Stage, Arc<StageMetrics>>,
}

impl Meters {
    fn for_stage(&mut self, stage: Stage) -> Arc<StageMetrics> {
        Arc::clone(self.stages.entry(stage).or_default())
    }
}

impl Pipeline {
    pub fn builder(config: DigestConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &DigestConfig {
        &self.config
    }

    fn phase(&self, phase: RunPhase) {
        info!("Phase: {}", phase);
        if let Some(cb) = &self.progress {
            cb.on_phase(phase);
        }
    }

    /// Widen `policy` to retry local I/O when artifact errors are retryable.
    fn io_aware(&self, policy: RetryPolicy) -> RetryPolicy {
        match self.config.analysis.artifact_errors {
            ArtifactErrorPolicy::Retry => policy.also_retry_io(),
            ArtifactErrorPolicy::BestEffort => policy,
        }
    }

    /// Scrape `date` from `source` and run it.
    pub async fn run_for_date(&self, source: &dyn PaperSource, date: NaiveDate) -> Result<RunOutput, DigestError> {
        self.phase(RunPhase::Scraping);
        let papers = source.papers_for(date).await?;
        info!("{} returned {} papers for {}", source.name(), papers.len(), date);
        self.run(date, papers).await
    }

    /// Run every date from `start` to `end` in turn.
    ///
    /// Dates without papers are skipped; the range fails with `NoPapers`
    /// only when none of its dates had any.
    pub async fn run_range(
        &self,
        source: &dyn PaperSource,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RunOutput>, DigestError> {
        let dates = dates_in_range(start, end)?;
        let mut outputs = Vec::with_capacity(dates.len());
        for date in dates {
            match self.run_for_date(source, date).await {
                Ok(output) => outputs.push(output),
                Err(DigestError::NoPapers { .. }) => warn!("No papers for {}, skipping", date),
                Err(e) => return Err(e),
            }
        }
        if outputs.is_empty() {
            return Err(DigestError::NoPapers {
                date: format!("{start}..{end}"),
            });
        }
        Ok(outputs)
    }

    /// Process `papers` for `date` and publish the daily report.
    ///
    /// Returns `Ok` even when individual papers failed; see
    /// [`RunOutput::failed`] and [`RunOutput::into_result`].
    ///
    /// # Errors
    /// Only run-fatal conditions detected before any worker starts: an empty
    /// listing, rejected library credentials, or a missing OCR model.
    pub async fn run(&self, date: NaiveDate, papers: Vec<PaperMeta>) -> Result<RunOutput, DigestError> {
        let started = Instant::now();
        let config = &self.config;
        let papers = dedupe(papers);
        if papers.is_empty() {
            return Err(DigestError::NoPapers {
                date: date.format("%Y-%m-%d").to_string(),
            });
        }
        let skip_deep = config.skip_deep_analysis;
        let ocr_model = match (&self.ocr_model, skip_deep) {
            (Some(model), _) => Some(Arc::clone(model)),
            (None, true) => None,
            (None, false) => {
                return Err(DigestError::ProviderNotConfigured {
                    provider: "ocr".into(),
                    hint: "deep analysis is enabled but no OCR model was built".into(),
                })
            }
        };

        let layout = Arc::new(StorageLayout::new(&config.storage.base_dir, date).with_papers(&papers));
        let publisher = Arc::new(Publisher::new(
            Arc::clone(&layout),
            Arc::clone(&self.library),
            config.library.parent_collection.clone().map(CollectionKey),
            self.io_aware(config.library.retry_policy()),
        ));
        let resolver = Arc::new(CategoryResolver::new(&config.filter));
        let existing = publisher.prepare().await?;
        resolver.register_all(existing.iter().map(String::as_str));

        let order: HashMap<String, usize> = papers.iter().enumerate().map(|(i, m)| (m.id.clone(), i)).collect();
        info!(
            "Run {}: {} papers, deep analysis {}",
            date,
            papers.len(),
            if skip_deep { "off" } else { "on" }
        );
        if let Some(cb) = &self.progress {
            cb.on_run_start(papers.len());
        }

        // ── Wiring ───────────────────────────────────────────────────────
        let mut meters = Meters::default();
        let sections = Arc::new(ReportSections::new());
        let (done_tx, mut done_rx) = unbounded_channel::<Paper>();
        let (filter_tx, filter_rx) = unbounded_channel();
        let (download_tx, download_rx) = unbounded_channel();
        let (publish_tx, publish_rx) = unbounded_channel();

        let sinks = |forward: UnboundedSender<Paper>| StageSinks {
            forward,
            retired: done_tx.clone(),
            failed: done_tx.clone(),
        };

        let progress = self.progress.clone();
        let collector = tokio::spawn(async move {
            let mut finished = Vec::new();
            while let Some(paper) = done_rx.recv().await {
                if paper.state() == ProcessingState::Published {
                    if let Some(cb) = &progress {
                        cb.on_paper_done(paper.id(), paper.state());
                    }
                }
                finished.push(paper);
            }
            finished
        });

        let filter = FilterStage::new(Arc::clone(&self.llm), &config.llm, &config.filter, Arc::clone(&resolver));
        let filter_task = StageExecutor::new(Arc::new(filter), config.concurrency.paper_workers, config.llm.retry_policy())
            .with_metrics(meters.for_stage(Stage::Filter))
            .with_progress(self.progress.clone())
            .spawn(filter_rx, sinks(download_tx));

        let download = DownloadStage::new(Arc::clone(&self.fetcher), Arc::clone(&layout));
        let download_policy = self.io_aware(config.download.retry_policy());

        // Stage task, and the phase entered once it has drained.
        let mut chain: Vec<(Stage, JoinHandle<()>, RunPhase)> = Vec::new();

        if let Some(ocr_model) = ocr_model {
            let (ocr_tx, ocr_rx) = unbounded_channel();
            let (analyze_tx, analyze_rx) = unbounded_channel();

            chain.push((
                Stage::Download,
                StageExecutor::new(Arc::new(download), config.concurrency.pdf_workers, download_policy)
                    .with_metrics(meters.for_stage(Stage::Download))
                    .with_progress(self.progress.clone())
                    .spawn(download_rx, sinks(ocr_tx)),
                RunPhase::Recognizing,
            ));

            let ocr = OcrStage::new(
                ocr_model,
                Arc::clone(&self.rasterizer),
                &config.ocr,
                OcrSettings::new(&config.analysis, &config.concurrency),
            );
            chain.push((
                Stage::Ocr,
                StageExecutor::new(
                    Arc::new(ocr),
                    config.concurrency.ocr_workers,
                    self.io_aware(config.ocr.retry_policy()),
                )
                .with_metrics(meters.for_stage(Stage::Ocr))
                .with_progress(self.progress.clone())
                .spawn(ocr_rx, sinks(analyze_tx)),
                RunPhase::Analyzing,
            ));

            let analyze = AnalyzeStage::new(
                Arc::clone(&self.llm),
                &config.llm,
                &config.analysis.note_language,
                config.analysis.max_figures_per_paper,
            );
            let analyze_exec = StageExecutor::new(Arc::new(analyze), config.concurrency.llm_workers, config.llm.retry_policy())
                .with_metrics(meters.for_stage(Stage::Analyze))
                .with_progress(self.progress.clone());

            if config.batch.enabled {
                let (batch_tx, batch_rx) = unbounded_channel();
                chain.push((
                    Stage::Analyze,
                    analyze_exec.spawn(analyze_rx, sinks(batch_tx)),
                    RunPhase::Summarizing,
                ));
                let summarizer = BatchSummarizer::new(
                    Arc::clone(&self.llm),
                    &config.llm,
                    &config.analysis.note_language,
                    config.batch.batch_size,
                    config.concurrency.llm_workers,
                    Arc::clone(&sections),
                )
                .with_metrics(meters.for_stage(Stage::Summarize))
                .with_progress(self.progress.clone());
                chain.push((
                    Stage::Summarize,
                    summarizer.spawn(batch_rx, publish_tx.clone()),
                    RunPhase::Publishing,
                ));
            } else {
                chain.push((
                    Stage::Analyze,
                    analyze_exec.spawn(analyze_rx, sinks(publish_tx.clone())),
                    RunPhase::Publishing,
                ));
            }
        } else {
            chain.push((
                Stage::Download,
                StageExecutor::new(Arc::new(download), config.concurrency.pdf_workers, download_policy)
                    .with_metrics(meters.for_stage(Stage::Download))
                    .with_progress(self.progress.clone())
                    .spawn(download_rx, sinks(publish_tx.clone())),
                RunPhase::Publishing,
            ));
        }
        drop(publish_tx);

        let publish_task = StageExecutor::new(
            Arc::clone(&publisher),
            config.concurrency.paper_workers,
            self.io_aware(config.library.retry_policy()),
        )
        .with_metrics(meters.for_stage(Stage::Publish))
        .with_progress(self.progress.clone())
        .spawn(publish_rx, sinks(done_tx.clone()));
        drop(done_tx);

        // ── Feed ─────────────────────────────────────────────────────────
        for meta in papers {
            if filter_tx.send(Paper::new(meta)).is_err() {
                warn!("Filter stage stopped before the input was fed");
                break;
            }
        }
        drop(filter_tx);
        self.phase(RunPhase::Filtering);

        // ── Drain, stage by stage ────────────────────────────────────────
        join_stage(Stage::Filter, filter_task).await;
        self.phase(RunPhase::Downloading);
        for (stage, task, next_phase) in chain {
            join_stage(stage, task).await;
            self.phase(next_phase);
        }
        join_stage(Stage::Publish, publish_task).await;

        let mut papers = collector
            .await
            .map_err(|e| DigestError::Internal(format!("paper collector failed: {e}")))?;
        papers.sort_by_key(|p| order.get(p.id()).copied().unwrap_or(usize::MAX));

        // ── Report ───────────────────────────────────────────────────────
        let report = DailyReport::finalize(&sections, &papers, &layout);
        let report_markdown = report.to_markdown();
        let report_error = match publisher.publish_report(&report_markdown).await {
            Ok(publication) => publication.upload_error,
            Err(e) => {
                warn!("Daily report not written: {}", e);
                Some(e.to_string())
            }
        };

        let failed: Vec<FailedPaper> = papers.iter().filter_map(FailedPaper::from_paper).collect();
        let batch_sections = sections.snapshot();
        let mut stats = RunStats::count(&papers);
        stats.batches = batch_sections.len();
        stats.failed_batches = batch_sections.iter().filter(|s| s.is_failed()).count();
        stats.stages = meters.stages.iter().map(|(stage, m)| (*stage, m.snapshot())).collect();
        stats.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            "Run {} complete: {} published, {} rejected, {} failed in {}ms",
            date, stats.published, stats.rejected, stats.failed, stats.duration_ms
        );
        if let Some(cb) = &self.progress {
            cb.on_run_complete(&stats);
        }
        self.phase(RunPhase::Done);

        Ok(RunOutput {
            date,
            report_path: layout.report_path(),
            report_markdown,
            report_error,
            papers,
            failed,
            stats,
        })
    }
}

/// Keep the first occurrence of every id.
fn dedupe(papers: Vec<PaperMeta>) -> Vec<PaperMeta> {
    let mut seen = HashSet::new();
    papers
        .into_iter()
        .filter(|m| {
            let fresh = seen.insert(m.id.clone());
            if !fresh {
                debug!("Dropping duplicate listing entry {}", m.id);
            }
            fresh
        })
        .collect()
}

async fn join_stage(stage: Stage, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        warn!("{} stage task ended abnormally: {}", stage, e);
    }
}
