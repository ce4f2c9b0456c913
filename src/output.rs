//! Output types returned by a pipeline run.

use crate::error::DigestError;
use crate::paper::{Paper, ProcessingState, Stage};
use crate::pipeline::executor::StageStats;
use crate::report::FailedPaper;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// The complete result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub date: NaiveDate,

    /// `<base_dir>/<date>/00_Daily_Report.md`.
    pub report_path: PathBuf,

    pub report_markdown: String,

    /// Set when the report could not be written or uploaded. Papers are
    /// unaffected.
    pub report_error: Option<String>,

    /// Every paper of the run in listing order, each in a terminal state.
    pub papers: Vec<Paper>,

    /// One row per paper that ended in `Failed(stage)`.
    pub failed: Vec<FailedPaper>,

    pub stats: RunStats,
}

impl RunOutput {
    /// True when no paper failed and the report went out.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.report_error.is_none()
    }

    /// Convert into `Err(PartialFailure)` when any paper failed.
    pub fn into_result(self) -> Result<Self, DigestError> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(DigestError::PartialFailure {
                failed: self.failed.len(),
                total: self.stats.total,
            })
        }
    }

    pub fn paper(&self, id: &str) -> Option<&Paper> {
        self.papers.iter().find(|p| p.id() == id)
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    /// Papers after deduplication.
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub published: usize,
    pub failed: usize,

    pub batches: usize,
    pub failed_batches: usize,

    /// Per-stage executor counters, for stages that ran.
    pub stages: BTreeMap<Stage, StageStats>,

    pub duration_ms: u64,
}

impl RunStats {
    /// Tally terminal states over `papers`.
    pub fn count(papers: &[Paper]) -> Self {
        let mut stats = Self {
            total: papers.len(),
            ..Self::default()
        };
        for p in papers {
            if p.verdict.as_ref().is_some_and(|v| v.accepted) {
                stats.accepted += 1;
            }
            match p.state() {
                ProcessingState::Filtered { accepted: false } => stats.rejected += 1,
                ProcessingState::Published => stats.published += 1,
                ProcessingState::Failed(_) => stats.failed += 1,
                _ => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{PaperMeta, Verdict};

    #[test]
    fn counts_terminal_states() {
        let mut rejected = Paper::new(PaperMeta::new("a", "A"));
        rejected.advance(ProcessingState::Filtered { accepted: false }).unwrap();

        let mut failed = Paper::new(PaperMeta::new("b", "B"));
        failed.verdict = Some(Verdict {
            accepted: true,
            ..Verdict::default()
        });
        failed.advance(ProcessingState::Filtered { accepted: true }).unwrap();
        failed.fail(Stage::Ocr, "no pages", 1);

        let stats = RunStats::count(&[rejected, failed]);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.published, 0);
    }

    #[test]
    fn stats_serialize_stage_keys_as_names() {
        let mut stats = RunStats::default();
        stats.stages.insert(Stage::Download, StageStats::default());
        let json = serde_json::to_value(&stats).unwrap();
        assert!(json["stages"]["download"].is_object());
    }
}
