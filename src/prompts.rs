//! Prompts for every model call in the pipeline.
//!
//! Keeping them in one place means wording changes never touch stage code,
//! and unit tests can inspect the rendered prompts without a model.

use crate::paper::{Figure, FigureKind, PaperMeta};

/// System prompt for the interest classifier.
pub const CLASSIFY_SYSTEM_PROMPT: &str = "You are a research assistant who screens new papers for one reader. \
Answer with a single JSON object and nothing else.";

/// Instruction sent with each page image. Grounding-capable OCR models emit
/// `label[[x1, y1, x2, y2]] text` for every region.
pub const OCR_PROMPT: &str = "<|grounding|>Convert the document to markdown.";

/// System prompt for the per-paper analysis call.
pub const ANALYSIS_SYSTEM_PROMPT: &str = "You are an expert reviewer writing structured reading notes on research papers. \
Answer with a single JSON object and nothing else.";

/// System prompt for batch synthesis.
pub const SYNTHESIS_SYSTEM_PROMPT: &str = "You write the daily research digest for one reader. \
Answer in Markdown without a top-level heading.";

/// Classification request for one paper.
pub fn classification_prompt(meta: &PaperMeta, interest: &str, ignore: &str, known_categories: &[String]) -> String {
    let known = if known_categories.is_empty() {
        "(none yet)".to_string()
    } else {
        known_categories.join(", ")
    };
    format!(
        r#"Decide whether the reader wants to read this paper.

Reader is interested in:
{interest}

Reader wants to ignore:
{ignore}

Existing categories: {known}
Reuse an existing category when one fits; propose a short new one (2-4 words) only if none does.

Title: {title}
Abstract: {abstract_text}

Reply with JSON:
{{
  "interested": true or false,
  "reason": "one sentence",
  "category": "category name, empty when not interested",
  "tags": ["3-5 short keywords"],
  "summary": "one-line summary of the paper",
  "tricks": "the key technique or trick, one or two sentences"
}}"#,
        interest = or_none(interest),
        ignore = or_none(ignore),
        title = meta.title,
        abstract_text = meta.abstract_text,
    )
}

/// Analysis request over the recognized text and candidate figure captions.
pub fn analysis_prompt(meta: &PaperMeta, ocr_text: &str, figures: &[Figure], language: &str) -> String {
    let figure_list = if figures.is_empty() {
        "(no figures extracted)".to_string()
    } else {
        figures
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let kind = match f.kind {
                    FigureKind::Figure => "figure",
                    FigureKind::Table => "table",
                };
                let caption = if f.caption.is_empty() { "(no caption)" } else { f.caption.as_str() };
                format!("{}. [{kind}, page {}] {caption}", i + 1, f.page)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        r#"Write reading notes for the paper below. Use {language} for every free-text field.

Title: {title}
Authors: {authors}

Candidate figures (in order):
{figure_list}

Recognized text:
<<<
{ocr_text}
>>>

Reply with JSON:
{{
  "title": "original title",
  "title_translated": "title in {language}",
  "authors": "author list",
  "core_problem": "what problem the paper solves",
  "core_contributions": ["contribution 1", "contribution 2"],
  "method_summary": "how the method works",
  "figure_descriptions": ["one description per candidate figure, same order"],
  "key_results": "main quantitative results",
  "key_tables": "what the key tables show",
  "conclusion": "conclusion",
  "pros": "strengths",
  "cons": "weaknesses",
  "inspirations": "ideas worth borrowing"
}}"#,
        title = meta.title,
        authors = meta.authors.join(", "),
    )
}

/// One paper's entry in a synthesis request.
pub struct SynthesisEntry<'a> {
    pub title: &'a str,
    pub category: &'a str,
    pub summary: &'a str,
    pub contributions: &'a [String],
}

/// Synthesis request for one batch.
pub fn synthesis_prompt(batch_index: usize, entries: &[SynthesisEntry<'_>], language: &str) -> String {
    let papers = entries
        .iter()
        .enumerate()
        .map(|(i, e)| {
            let mut s = format!("{}. {} [{}]\n   {}", i + 1, e.title, e.category, e.summary);
            for c in e.contributions {
                s.push_str(&format!("\n   - {c}"));
            }
            s
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Write section {} of today's digest in {language}. Summarize the common themes across these papers, \
then give each paper one or two sentences on why it matters.\n\n{papers}",
        batch_index + 1
    )
}

fn or_none(s: &str) -> &str {
    if s.trim().is_empty() {
        "(not specified)"
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_prompt_lists_categories_and_preferences() {
        let meta = PaperMeta::new("2405.1", "World Models for Driving").with_abstract("We learn a world model.");
        let p = classification_prompt(&meta, "world models", "", &["Robotics".into(), "Vision".into()]);
        assert!(p.contains("Robotics, Vision"));
        assert!(p.contains("world models"));
        assert!(p.contains("(not specified)"));
        assert!(p.contains("We learn a world model."));
    }

    #[test]
    fn analysis_prompt_numbers_figures() {
        let meta = PaperMeta::new("2405.1", "T");
        let fig = Figure {
            kind: FigureKind::Table,
            page: 3,
            label: "table".into(),
            caption: "Table 1: results".into(),
            bbox: [0, 0, 10, 10],
            path: None,
            description: None,
        };
        let p = analysis_prompt(&meta, "text", &[fig], "English");
        assert!(p.contains("1. [table, page 3] Table 1: results"));
    }

    #[test]
    fn synthesis_prompt_is_one_based() {
        let contributions = vec!["c1".to_string()];
        let entries = [SynthesisEntry {
            title: "A",
            category: "X",
            summary: "s",
            contributions: &contributions,
        }];
        let p = synthesis_prompt(0, &entries, "English");
        assert!(p.contains("section 1"));
        assert!(p.contains("- c1"));
    }
}
