//! In-memory model of one paper moving through the pipeline.
//!
//! A [`Paper`] is owned by exactly one stage at a time: stages receive it by
//! value over a channel, fold their output into it and hand it on. Its
//! [`ProcessingState`] only moves forward; see [`Paper::advance`].

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Listing record produced by a [`crate::source::PaperSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperMeta {
    /// arXiv id without version suffix, e.g. `2405.01234`. The fingerprint.
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub published: Option<NaiveDate>,
    pub pdf_url: String,
}

impl PaperMeta {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let id = id.into();
        let pdf_url = format!("https://arxiv.org/pdf/{id}.pdf");
        Self {
            id,
            title: title.into(),
            authors: Vec::new(),
            abstract_text: String::new(),
            published: None,
            pdf_url,
        }
    }

    pub fn with_authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_abstract(mut self, text: impl Into<String>) -> Self {
        self.abstract_text = text.into();
        self
    }

    pub fn abs_url(&self) -> String {
        format!("https://arxiv.org/abs/{}", self.id)
    }

    /// `FirstAuthor_Title` directory name: sanitized first author, `_`,
    /// sanitized title cut at 40 characters.
    pub fn folder_name(&self) -> String {
        let author = self
            .authors
            .first()
            .map(|a| sanitize_filename(a))
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());
        let title: String = self.title.chars().take(40).collect();
        let title = sanitize_filename(&title);
        let title = if title.is_empty() { sanitize_filename(&self.id) } else { title };
        format!("{author}_{title}")
    }
}

static ILLEGAL_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\\/*?:"<>|]"#).expect("valid regex"));

/// Remove `\ / * ? : " < > |`, trim, and replace spaces with `_`.
pub fn sanitize_filename(s: &str) -> String {
    ILLEGAL_FILENAME_CHARS.replace_all(s, "").trim().replace(' ', "_")
}

/// Pipeline stages, in processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Filter,
    Download,
    Ocr,
    Analyze,
    Summarize,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Filter => "filter",
            Stage::Download => "download",
            Stage::Ocr => "ocr",
            Stage::Analyze => "analyze",
            Stage::Summarize => "summarize",
            Stage::Publish => "publish",
        };
        f.write_str(s)
    }
}

/// Where a paper is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Pending,
    Filtered { accepted: bool },
    Downloaded,
    Recognized,
    Analyzed,
    Summarized,
    Published,
    Failed(Stage),
}

impl ProcessingState {
    fn rank(&self) -> u8 {
        match self {
            ProcessingState::Pending => 0,
            ProcessingState::Filtered { .. } => 1,
            ProcessingState::Downloaded => 2,
            ProcessingState::Recognized => 3,
            ProcessingState::Analyzed => 4,
            ProcessingState::Summarized => 5,
            ProcessingState::Published => 6,
            ProcessingState::Failed(_) => u8::MAX,
        }
    }

    /// Published, rejected, or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingState::Published | ProcessingState::Failed(_) | ProcessingState::Filtered { accepted: false }
        )
    }

    /// Forward moves (including skips) and failure from any live state.
    pub fn can_advance_to(&self, next: ProcessingState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            ProcessingState::Failed(_) => true,
            ProcessingState::Pending => false,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingState::Pending => f.write_str("pending"),
            ProcessingState::Filtered { accepted: true } => f.write_str("accepted"),
            ProcessingState::Filtered { accepted: false } => f.write_str("rejected"),
            ProcessingState::Downloaded => f.write_str("downloaded"),
            ProcessingState::Recognized => f.write_str("recognized"),
            ProcessingState::Analyzed => f.write_str("analyzed"),
            ProcessingState::Summarized => f.write_str("summarized"),
            ProcessingState::Published => f.write_str("published"),
            ProcessingState::Failed(stage) => write!(f, "failed at {stage}"),
        }
    }
}

/// Rejected state regression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("paper {id}: cannot move from {from} to {to}")]
pub struct TransitionError {
    pub id: String,
    pub from: ProcessingState,
    pub to: ProcessingState,
}

/// One entry in a paper's error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: Stage,
    pub message: String,
    pub attempts: u32,
}

/// Classification outcome, category already reconciled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub accepted: bool,
    pub category: Option<String>,
    pub reason: String,
    pub tags: Vec<String>,
    pub summary: String,
    pub tricks: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FigureKind {
    Figure,
    Table,
}

/// A cropped figure or table region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Figure {
    pub kind: FigureKind,
    /// 1-based page number.
    pub page: usize,
    /// Grounding label as emitted by the OCR model (`image`, `table`, …).
    pub label: String,
    pub caption: String,
    /// `[x1, y1, x2, y2]` normalized to 0–1000.
    pub bbox: [u32; 4],
    /// File written under `figures/`, None when cropping was disabled or failed.
    pub path: Option<PathBuf>,
    /// Description supplied by the analysis model.
    pub description: Option<String>,
}

/// Recognized text handed to analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrText {
    pub text: String,
    /// Set when `text` was cut to `max_ocr_text_length`.
    pub truncated: bool,
    pub pages_total: usize,
    pub pages_recognized: usize,
}

/// Structured analysis returned by the analysis model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperAnalysis {
    pub title: String,
    pub title_translated: String,
    pub authors: String,
    pub core_problem: String,
    #[serde(deserialize_with = "one_or_many")]
    pub core_contributions: Vec<String>,
    pub method_summary: String,
    #[serde(deserialize_with = "one_or_many")]
    pub figure_descriptions: Vec<String>,
    pub key_results: String,
    pub key_tables: String,
    pub conclusion: String,
    pub pros: String,
    pub cons: String,
    pub inspirations: String,
}

// Models alternate between a list and a single string for list fields.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) if s.trim().is_empty() => Vec::new(),
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
        OneOrMany::Null(()) => Vec::new(),
    })
}

/// Files written for a paper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    /// `<base>/<date>/<Category>/<Author_Title>`.
    pub paper_dir: Option<PathBuf>,
    pub pdf_path: Option<PathBuf>,
    pub note_path: Option<PathBuf>,
    pub figures: Vec<Figure>,
}

/// A paper and everything the pipeline learned about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paper {
    pub meta: PaperMeta,
    state: ProcessingState,
    pub verdict: Option<Verdict>,
    pub artifacts: Artifacts,
    pub ocr: Option<OcrText>,
    pub analysis: Option<PaperAnalysis>,
    /// Rendered markdown note.
    pub note: Option<String>,
    pub errors: Vec<ErrorRecord>,
}

impl Paper {
    pub fn new(meta: PaperMeta) -> Self {
        Self {
            meta,
            state: ProcessingState::Pending,
            verdict: None,
            artifacts: Artifacts::default(),
            ocr: None,
            analysis: None,
            note: None,
            errors: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn title(&self) -> &str {
        &self.meta.title
    }

    pub fn state(&self) -> ProcessingState {
        self.state
    }

    /// Reconciled category, None until filtered (or when rejected).
    pub fn category(&self) -> Option<&str> {
        self.verdict.as_ref().and_then(|v| v.category.as_deref())
    }

    pub fn ocr_truncated(&self) -> bool {
        self.ocr.as_ref().is_some_and(|o| o.truncated)
    }

    /// Move to `next`. Regressions and moves out of a terminal state are
    /// rejected and leave the state untouched.
    pub fn advance(&mut self, next: ProcessingState) -> Result<(), TransitionError> {
        if !self.state.can_advance_to(next) {
            return Err(TransitionError {
                id: self.meta.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Append to the error history without changing state.
    pub fn record_error(&mut self, stage: Stage, message: impl Into<String>, attempts: u32) {
        self.errors.push(ErrorRecord {
            stage,
            message: message.into(),
            attempts,
        });
    }

    /// Terminate at `stage` and record why.
    pub fn fail(&mut self, stage: Stage, message: impl Into<String>, attempts: u32) {
        self.record_error(stage, message, attempts);
        // A paper that is already terminal keeps its state; the record is enough.
        let _ = self.advance(ProcessingState::Failed(stage));
    }

    /// Most recent error, used for failure tables.
    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.errors.last()
    }
}
