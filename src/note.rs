//! Markdown rendering for per-paper reading notes.
//!
//! Two shapes exist: the full note built from a [`PaperAnalysis`] with the
//! selected figures woven into the method and results sections, and a brief
//! note built from the classifier verdict alone, used when deep analysis is
//! skipped.

use crate::paper::{Figure, FigureKind, Paper, PaperAnalysis};
use crate::pipeline::figures::{caption_label, figure_role, FigureRole};
use std::fmt::Write as _;
use std::path::Path;

const NOT_EXTRACTED: &str = "_Not extracted._";

fn or_placeholder(s: &str) -> &str {
    if s.trim().is_empty() {
        NOT_EXTRACTED
    } else {
        s.trim()
    }
}

/// `path` relative to `base` with `/` separators; the full path when it is
/// not under `base`.
fn link_path(path: &Path, base: Option<&Path>) -> String {
    let rel = base.and_then(|b| path.strip_prefix(b).ok()).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn header(out: &mut String, paper: &Paper, title: &str) {
    let _ = writeln!(out, "# {}\n", title);
    let authors = if paper.meta.authors.is_empty() {
        "Unknown".to_string()
    } else {
        paper.meta.authors.join(", ")
    };
    let _ = writeln!(out, "**Authors**: {}\n", authors);
    let date = paper
        .meta
        .published
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let _ = writeln!(out, "**Source**: [arXiv {}]({}) | **Date**: {}\n", paper.id(), paper.meta.abs_url(), date);
    if let Some(category) = paper.category() {
        let _ = writeln!(out, "**Category**: {}\n", category);
    }
}

fn figure_block(out: &mut String, figure: &Figure, ordinal: usize, paper_dir: Option<&Path>) {
    let label = caption_label(figure, ordinal);
    if let Some(desc) = figure.description.as_deref().filter(|d| !d.trim().is_empty()) {
        let _ = writeln!(out, "{}\n", desc.trim());
    }
    match &figure.path {
        Some(path) => {
            let _ = writeln!(out, "![{}]({})\n", label, link_path(path, paper_dir));
        }
        None => {
            let _ = writeln!(out, "> {} (page {})\n", label, figure.page);
        }
    }
    if !figure.caption.is_empty() {
        let _ = writeln!(out, "*{}*\n", figure.caption);
    }
}

/// Full reading note. Architecture figures follow the method section; result
/// figures and tables follow the results section; anything else is listed
/// under "Other figures".
pub fn render_note(paper: &Paper, analysis: &PaperAnalysis, figures: &[Figure]) -> String {
    let mut out = String::new();
    let title = if analysis.title.trim().is_empty() {
        paper.title()
    } else {
        analysis.title.trim()
    };
    header(&mut out, paper, title);
    if !analysis.title_translated.trim().is_empty() && analysis.title_translated.trim() != title {
        let _ = writeln!(out, "**Translated title**: {}\n", analysis.title_translated.trim());
    }
    out.push_str("---\n\n");

    let _ = writeln!(out, "## Core problem\n\n{}\n", or_placeholder(&analysis.core_problem));

    out.push_str("## Contributions\n\n");
    if analysis.core_contributions.is_empty() {
        let _ = writeln!(out, "{}\n", NOT_EXTRACTED);
    } else {
        for c in &analysis.core_contributions {
            let _ = writeln!(out, "- {}", c.trim());
        }
        out.push('\n');
    }

    let _ = writeln!(out, "## Method\n\n{}\n", or_placeholder(&analysis.method_summary));

    let paper_dir = paper.artifacts.paper_dir.as_deref();
    let numbered: Vec<(usize, &Figure)> = figures.iter().enumerate().map(|(i, f)| (i + 1, f)).collect();
    let of_role = |roles: &[FigureRole]| -> Vec<(usize, &Figure)> {
        numbered
            .iter()
            .filter(|(_, f)| roles.contains(&figure_role(f)))
            .copied()
            .collect()
    };

    let architecture = of_role(&[FigureRole::Architecture]);
    if !architecture.is_empty() {
        out.push_str("**Architecture**\n\n");
        for (n, f) in architecture {
            figure_block(&mut out, f, n, paper_dir);
        }
    }
    out.push_str("---\n\n");

    let _ = writeln!(out, "## Results\n\n{}\n", or_placeholder(&analysis.key_results));
    if !analysis.key_tables.trim().is_empty() {
        let _ = writeln!(out, "{}\n", analysis.key_tables.trim());
    }
    let results = of_role(&[FigureRole::Result, FigureRole::Table]);
    if !results.is_empty() {
        out.push_str("**Experimental evidence**\n\n");
        for (n, f) in results {
            figure_block(&mut out, f, n, paper_dir);
        }
    }
    let other = of_role(&[FigureRole::Other]);
    if !other.is_empty() {
        out.push_str("**Other figures**\n\n");
        for (n, f) in other {
            figure_block(&mut out, f, n, paper_dir);
        }
    }
    out.push_str("---\n\n");

    let _ = writeln!(out, "## Conclusion\n\n{}\n", or_placeholder(&analysis.conclusion));

    out.push_str("---\n\n## Reviewer notes\n\n");
    let _ = writeln!(out, "### Strengths\n\n{}\n", or_placeholder(&analysis.pros));
    let _ = writeln!(out, "### Limitations\n\n{}\n", or_placeholder(&analysis.cons));
    let _ = writeln!(out, "### Inspirations\n\n{}\n", or_placeholder(&analysis.inspirations));

    out.push_str("---\n\n## Processing\n\n");
    if let Some(ocr) = &paper.ocr {
        let _ = writeln!(out, "- Pages recognized: {}/{}", ocr.pages_recognized, ocr.pages_total);
        if ocr.truncated {
            let _ = writeln!(out, "- Recognized text was truncated to {} characters", ocr.text.chars().count());
        }
    }
    let tables = figures.iter().filter(|f| f.kind == FigureKind::Table).count();
    let _ = writeln!(out, "- Figures: {}, tables: {}", figures.len() - tables, tables);
    out
}

/// Note built from the classifier verdict and abstract only.
pub fn render_brief_note(paper: &Paper) -> String {
    let mut out = String::new();
    header(&mut out, paper, paper.title());
    out.push_str("---\n\n");
    if let Some(v) = &paper.verdict {
        if !v.summary.trim().is_empty() {
            let _ = writeln!(out, "## Summary\n\n{}\n", v.summary.trim());
        }
        if !v.reason.trim().is_empty() {
            let _ = writeln!(out, "## Why it was selected\n\n{}\n", v.reason.trim());
        }
        if !v.tricks.trim().is_empty() {
            let _ = writeln!(out, "## Key tricks\n\n{}\n", v.tricks.trim());
        }
        if !v.tags.is_empty() {
            let _ = writeln!(out, "**Tags**: {}\n", v.tags.join(", "));
        }
    }
    let _ = writeln!(out, "## Abstract\n\n{}\n", or_placeholder(&paper.meta.abstract_text));
    out
}
