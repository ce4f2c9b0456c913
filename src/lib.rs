//! # paper-digest
//!
//! Turn a day's research-paper listing into a curated digest: classify every
//! paper against a reader's interests, download and OCR the accepted ones,
//! write a structured note per paper, synthesize the notes into a daily
//! report, and publish everything to a local tree and a Zotero library.
//!
//! ## Why a staged pipeline?
//!
//! A daily listing holds tens to hundreds of papers and every step waits on a
//! remote model or server. Each stage runs its own bounded worker pool, so a
//! slow OCR provider never starves classification, and a paper that fails at
//! one stage is recorded and dropped without touching its siblings.
//!
//! ## Pipeline Overview
//!
//! ```text
//! listing
//!  │
//!  ├─ 1. Filter    LLM verdict + category reconciliation
//!  ├─ 2. Download  PDF fetch, validation, local reuse
//!  ├─ 3. OCR       pdfium rasterisation → grounding VLM → figure crops
//!  ├─ 4. Analyze   structured JSON analysis → markdown note
//!  ├─ 5. Batch     index-ordered report sections
//!  └─ 6. Publish   note.md + analysis.json, Zotero item + note, daily report
//! ```
//!
//! With `skip_deep_analysis` accepted papers go straight from download to
//! publish with a note built from the classification alone.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use paper_digest::{parse_date, DigestConfig, HfDailySource, Pipeline};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = DigestConfig::from_yaml_file("digest.yaml")?;
//!     config.apply_env();
//!     let pipeline = Pipeline::builder(config).build()?;
//!     let source = HfDailySource::new(Duration::from_secs(30))?;
//!     let output = pipeline.run_for_date(&source, parse_date("2025-03-07")?).await?;
//!     println!("{}", output.report_markdown);
//!     eprintln!("{} published, {} failed", output.stats.published, output.stats.failed);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `paper-digest` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! paper-digest = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod layout;
pub mod library;
pub mod note;
pub mod output;
pub mod paper;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod report;
pub mod run;
pub mod source;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    AnalysisConfig, ArtifactErrorPolicy, BatchConfig, CategoryPolicy, ConcurrencyConfig, DigestConfig,
    DigestConfigBuilder, DownloadConfig, FilterConfig, LibraryConfig, LibraryType, ProviderConfig, StorageConfig,
};
pub use error::{DigestError, StageError};
pub use library::{LibraryClient, NullLibrary, ZoteroClient};
pub use output::{RunOutput, RunStats};
pub use paper::{Figure, FigureKind, Paper, PaperAnalysis, PaperMeta, ProcessingState, Stage, Verdict};
pub use pipeline::download::PdfFetcher;
pub use pipeline::llm::{ChatReply, ChatRequest, LanguageModel};
pub use pipeline::render::PageRasterizer;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use report::{DailyReport, FailedPaper};
pub use run::{Pipeline, PipelineBuilder, RunPhase};
pub use source::{dates_in_range, parse_date, HfDailySource, PaperSource};
