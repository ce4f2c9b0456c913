//! Daily report: batch sections keyed by batch index plus per-paper listings.
//!
//! Sections are inserted by the batch summarizer as syntheses finish, in any
//! order; rendering always walks them by index. The listing, ignored and
//! failure tables are built from the papers once every stage has drained.

use crate::layout::StorageLayout;
use crate::paper::{Paper, ProcessingState, Stage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};

/// Outcome of one batch's synthesis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SectionOutcome {
    Summarized { markdown: String },
    Failed { error: String, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSection {
    /// 0-based position in analysis-completion order.
    pub index: usize,
    pub paper_ids: Vec<String>,
    pub titles: Vec<String>,
    pub outcome: SectionOutcome,
}

impl BatchSection {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, SectionOutcome::Failed { .. })
    }
}

/// Shared accumulator written by the batch summarizer.
#[derive(Debug, Default)]
pub struct ReportSections {
    sections: Mutex<BTreeMap<usize, BatchSection>>,
}

impl ReportSections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a section. A section already present at the same index is kept;
    /// summarized sections never change.
    pub fn insert(&self, section: BatchSection) -> bool {
        let mut sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        if sections.contains_key(&section.index) {
            return false;
        }
        sections.insert(section.index, section);
        true
    }

    pub fn len(&self) -> usize {
        self.sections.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sections in index order.
    pub fn snapshot(&self) -> Vec<BatchSection> {
        self.sections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedPaper {
    pub id: String,
    pub title: String,
    pub url: String,
    pub reason: String,
    pub summary: String,
    pub tricks: String,
    /// PDF path relative to the run directory.
    pub pdf_link: Option<String>,
    /// Note path relative to the run directory.
    pub note_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IgnoredPaper {
    pub id: String,
    pub title: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPaper {
    pub id: String,
    pub title: String,
    pub stage: Stage,
    pub reason: String,
    pub attempts: u32,
}

impl FailedPaper {
    /// The summary row for a paper in `Failed(stage)`, None otherwise.
    pub fn from_paper(paper: &Paper) -> Option<Self> {
        let ProcessingState::Failed(stage) = paper.state() else {
            return None;
        };
        let last = paper.errors.iter().rev().find(|e| e.stage == stage).or(paper.last_error());
        Some(Self {
            id: paper.id().to_string(),
            title: paper.title().to_string(),
            stage,
            reason: last.map(|e| e.message.clone()).unwrap_or_default(),
            attempts: last.map(|e| e.attempts).unwrap_or(0),
        })
    }
}

/// Finalized report for one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyReport {
    pub date: chrono::NaiveDate,
    pub sections: Vec<BatchSection>,
    /// Published papers grouped by category.
    pub categories: BTreeMap<String, Vec<ListedPaper>>,
    pub ignored: Vec<IgnoredPaper>,
    pub failed: Vec<FailedPaper>,
    pub total: usize,
}

const IGNORED_TITLE_CHARS: usize = 80;

fn short_title(title: &str) -> String {
    if title.chars().count() > IGNORED_TITLE_CHARS {
        let cut: String = title.chars().take(IGNORED_TITLE_CHARS).collect();
        format!("{}...", cut)
    } else {
        title.to_string()
    }
}

fn table_cell(s: &str) -> String {
    s.replace('|', "\\|").replace('\n', " ")
}

impl DailyReport {
    /// Build the report once all batches are in and every paper is terminal.
    pub fn finalize(sections: &ReportSections, papers: &[Paper], layout: &StorageLayout) -> Self {
        let mut categories: BTreeMap<String, Vec<ListedPaper>> = BTreeMap::new();
        let mut ignored = Vec::new();
        let mut failed = Vec::new();

        for paper in papers {
            match paper.state() {
                ProcessingState::Published => {
                    let category = paper.category().unwrap_or("Other").to_string();
                    let verdict = paper.verdict.clone().unwrap_or_default();
                    categories.entry(category).or_default().push(ListedPaper {
                        id: paper.id().to_string(),
                        title: paper.title().to_string(),
                        url: paper.meta.abs_url(),
                        reason: verdict.reason,
                        summary: verdict.summary,
                        tricks: verdict.tricks,
                        pdf_link: paper.artifacts.pdf_path.as_deref().map(|p| layout.relative_link(p)),
                        note_link: paper.artifacts.note_path.as_deref().map(|p| layout.relative_link(p)),
                    });
                }
                ProcessingState::Filtered { accepted: false } => ignored.push(IgnoredPaper {
                    id: paper.id().to_string(),
                    title: paper.title().to_string(),
                    reason: paper.verdict.as_ref().map(|v| v.reason.clone()).unwrap_or_default(),
                }),
                ProcessingState::Failed(_) => failed.extend(FailedPaper::from_paper(paper)),
                _ => {}
            }
        }
        for listed in categories.values_mut() {
            listed.sort_by(|a, b| a.id.cmp(&b.id));
        }
        ignored.sort_by(|a, b| a.id.cmp(&b.id));
        failed.sort_by(|a, b| a.id.cmp(&b.id));

        Self {
            date: layout.date(),
            sections: sections.snapshot(),
            categories,
            ignored,
            failed,
            total: papers.len(),
        }
    }

    pub fn published_count(&self) -> usize {
        self.categories.values().map(Vec::len).sum()
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Daily Paper Digest {}\n", self.date.format("%Y-%m-%d"));
        let _ = writeln!(
            out,
            "{} papers screened, {} published, {} ignored, {} failed.\n",
            self.total,
            self.published_count(),
            self.ignored.len(),
            self.failed.len()
        );

        if !self.sections.is_empty() {
            out.push_str("## Highlights\n\n");
            for section in &self.sections {
                match &section.outcome {
                    SectionOutcome::Summarized { markdown } => {
                        let _ = writeln!(out, "{}\n", markdown.trim());
                    }
                    SectionOutcome::Failed { error, attempts } => {
                        let _ = writeln!(
                            out,
                            "### Section {} (not summarized)\n\n_Synthesis failed after {} attempt(s): {}_\n",
                            section.index + 1,
                            attempts,
                            error
                        );
                        for title in &section.titles {
                            let _ = writeln!(out, "- {}", title);
                        }
                        out.push('\n');
                    }
                }
            }
        }

        if !self.categories.is_empty() {
            out.push_str("## Papers by category\n\n");
            for (category, papers) in &self.categories {
                let _ = writeln!(out, "### {} ({})\n", category, papers.len());
                for p in papers {
                    let _ = writeln!(out, "#### [{}]({})\n", p.title, p.url);
                    if !p.reason.trim().is_empty() {
                        let _ = writeln!(out, "> **Why it was picked**: {}\n", p.reason.trim());
                    }
                    if !p.summary.trim().is_empty() {
                        let _ = writeln!(out, "- **Summary**: {}", p.summary.trim());
                    }
                    if !p.tricks.trim().is_empty() {
                        let _ = writeln!(out, "- **Key tricks**: {}", p.tricks.trim());
                    }
                    let links: Vec<String> = [("PDF", &p.pdf_link), ("Note", &p.note_link)]
                        .into_iter()
                        .filter_map(|(name, link)| {
                            link.as_ref().map(|l| format!("[{}]({})", name, l.replace(' ', "%20")))
                        })
                        .collect();
                    if !links.is_empty() {
                        let _ = writeln!(out, "- {}", links.join(" | "));
                    }
                    out.push('\n');
                }
                out.push('\n');
            }
        }

        if !self.ignored.is_empty() {
            out.push_str("## Ignored\n\n| Title | Reason |\n|---|---|\n");
            for p in &self.ignored {
                let _ = writeln!(out, "| {} | {} |", table_cell(&short_title(&p.title)), table_cell(&p.reason));
            }
            out.push('\n');
        }

        if !self.failed.is_empty() {
            out.push_str("## Failed\n\n| Paper | Stage | Reason | Attempts |\n|---|---|---|---|\n");
            for p in &self.failed {
                let _ = writeln!(
                    out,
                    "| {} ({}) | {} | {} | {} |",
                    table_cell(&short_title(&p.title)),
                    p.id,
                    p.stage,
                    table_cell(&p.reason),
                    p.attempts
                );
            }
            out.push('\n');
        }
        out
    }
}
