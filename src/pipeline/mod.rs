//! Pipeline stages for the daily digest.
//!
//! Each paper-level stage implements [`executor::StageOperation`] and runs
//! under a [`executor::StageExecutor`] with its own worker limit and retry
//! policy. The batch summarizer is the one stage that works on groups of
//! papers rather than single papers.
//!
//! ## Data Flow
//!
//! ```text
//! filter ──▶ download ──▶ ocr ──▶ analyze ──▶ batch ──▶ publish
//! (LLM)      (HTTP)       (VLM)   (LLM)       (LLM)     (files + library)
//! ```
//!
//! 1. [`filter`]:   classify title + abstract; [`category`] reconciles the
//!    proposed category against known ones
//! 2. [`download`]: fetch and validate the PDF, reusing a valid local copy
//! 3. [`ocr`]:      rasterise pages ([`render`], `spawn_blocking` because
//!    pdfium is not async-safe), recognise them with a grounding VLM,
//!    crop [`figures`]
//! 4. [`analyze`]:  structured analysis and the per-paper note
//! 5. [`batch`]:    fixed-size, index-ordered summary sections
//! 6. [`publish`]:  local note/analysis files and library upload
//!
//! [`llm`] and [`encode`] are shared by every stage that talks to a model.

pub mod analyze;
pub mod batch;
pub mod category;
pub mod download;
pub mod encode;
pub mod executor;
pub mod figures;
pub mod filter;
pub mod llm;
pub mod ocr;
pub mod publish;
pub mod render;
