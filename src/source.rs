//! Daily listing: which papers to look at for a date.
//!
//! [`HfDailySource`] scrapes arXiv ids from the Hugging Face daily-papers page
//! and fills in metadata from the arXiv export API, ten ids per query.

use crate::error::DigestError;
use crate::paper::PaperMeta;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use once_cell::sync::Lazy;
use quick_xml::de::from_str;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Produces paper metadata for one date.
#[async_trait]
pub trait PaperSource: Send + Sync {
    fn name(&self) -> &str;

    async fn papers_for(&self, date: NaiveDate) -> Result<Vec<PaperMeta>, DigestError>;
}

/// Every date from `start` to `end`, both included.
pub fn dates_in_range(start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>, DigestError> {
    if end < start {
        return Err(DigestError::InvalidDate {
            input: format!("{start}..{end} (end before start)"),
        });
    }
    Ok(start.iter_days().take_while(|d| *d <= end).collect())
}

pub fn parse_date(input: &str) -> Result<NaiveDate, DigestError> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").map_err(|_| DigestError::InvalidDate {
        input: input.to_string(),
    })
}

static PAPER_HREF: Lazy<Regex> = Lazy::new(|| Regex::new(r#"href="/papers/([^"?#/]+)"#).expect("valid regex"));
static ARXIV_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}\.\d{4,5}$").expect("valid regex"));
static VERSION_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"v\d+$").expect("valid regex"));

/// arXiv ids linked from a daily-papers page, first occurrence order, no duplicates.
pub fn extract_arxiv_ids(html: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    PAPER_HREF
        .captures_iter(html)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .filter(|id| ARXIV_ID.is_match(id))
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    id: String,
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    published: String,
    #[serde(rename = "author", default)]
    authors: Vec<AtomAuthor>,
}

#[derive(Debug, Deserialize)]
struct AtomAuthor {
    name: String,
}

fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `http://arxiv.org/abs/2405.12345v2` → `2405.12345`.
fn bare_id(entry_id: &str) -> String {
    let tail = entry_id.trim().rsplit('/').next().unwrap_or_default();
    VERSION_SUFFIX.replace(tail, "").into_owned()
}

/// Parse an arXiv export API Atom response.
pub fn parse_arxiv_feed(xml: &str) -> Result<Vec<PaperMeta>, DigestError> {
    let feed: AtomFeed = from_str(xml).map_err(|e| DigestError::SourceFailed {
        source_name: "arxiv".into(),
        detail: format!("invalid atom xml: {e}"),
    })?;
    Ok(feed
        .entries
        .into_iter()
        .map(|entry| {
            let mut meta = PaperMeta::new(bare_id(&entry.id), clean_text(&entry.title))
                .with_authors(entry.authors.iter().map(|a| clean_text(&a.name)))
                .with_abstract(clean_text(&entry.summary));
            meta.published = DateTime::parse_from_rfc3339(entry.published.trim())
                .ok()
                .map(|dt| dt.date_naive());
            meta
        })
        .collect())
}

const LISTING_URL: &str = "https://huggingface.co/papers";
const ARXIV_API_URL: &str = "https://export.arxiv.org/api/query";
const METADATA_CHUNK: usize = 10;

/// Hugging Face daily papers + arXiv metadata.
pub struct HfDailySource {
    http: reqwest::Client,
}

impl HfDailySource {
    pub fn new(timeout: Duration) -> Result<Self, DigestError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("paper-digest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DigestError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self { http })
    }

    async fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<String, DigestError> {
        let failed = |detail: String| DigestError::SourceFailed {
            source_name: self.name().to_string(),
            detail,
        };
        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("{url} returned HTTP {}", status.as_u16())));
        }
        response.text().await.map_err(|e| failed(e.to_string()))
    }
}

#[async_trait]
impl PaperSource for HfDailySource {
    fn name(&self) -> &str {
        "huggingface-daily"
    }

    async fn papers_for(&self, date: NaiveDate) -> Result<Vec<PaperMeta>, DigestError> {
        let day = date.format("%Y-%m-%d").to_string();
        info!("Fetching daily listing for {}", day);
        let html = self.get_text(LISTING_URL, &[("date", day.clone())]).await?;
        let ids = extract_arxiv_ids(&html);
        info!("Listing has {} arXiv ids", ids.len());
        if ids.is_empty() {
            return Err(DigestError::NoPapers { date: day });
        }

        let mut papers = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(METADATA_CHUNK) {
            let query = [
                ("id_list", chunk.join(",")),
                ("max_results", chunk.len().to_string()),
            ];
            match self.get_text(ARXIV_API_URL, &query).await.and_then(|xml| parse_arxiv_feed(&xml)) {
                Ok(mut metas) => {
                    debug!("arXiv metadata: {} of {} ids resolved", metas.len(), chunk.len());
                    papers.append(&mut metas);
                }
                Err(e) => warn!("Skipping {} ids, metadata lookup failed: {}", chunk.len(), e),
            }
        }
        if papers.is_empty() {
            return Err(DigestError::NoPapers { date: day });
        }
        Ok(papers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_filtered_and_deduplicated() {
        let html = r##"
            <a href="/papers/2405.12345">a</a>
            <a href="/papers/2405.12345#community">again</a>
            <a href="/papers/2405.0999">short</a>
            <a href="/papers/2405.54321?x=1">b</a>
            <a href="/papers/submit">submit</a>
            <a href="/papers?date=2025-03-06">prev</a>
        "##;
        assert_eq!(extract_arxiv_ids(html), vec!["2405.12345", "2405.0999", "2405.54321"]);
    }

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <id>http://arxiv.org/api/query</id>
  <entry>
    <id>http://arxiv.org/abs/1706.03762v7</id>
    <updated>2023-08-02T17:54:37Z</updated>
    <published>2017-06-12T17:57:40Z</published>
    <title>
      Attention Is All
      You Need
    </title>
    <summary>  The dominant sequence transduction models.  </summary>
    <author><name>Ashish Vaswani</name></author>
    <author><name>Noam Shazeer</name></author>
    <link title="pdf" rel="related" type="application/pdf" href="http://arxiv.org/pdf/1706.03762v7" />
  </entry>
</feed>"#;

    #[test]
    fn atom_feed_becomes_metadata() {
        let papers = parse_arxiv_feed(FEED).unwrap();
        assert_eq!(papers.len(), 1);
        let p = &papers[0];
        assert_eq!(p.id, "1706.03762");
        assert_eq!(p.title, "Attention Is All You Need");
        assert_eq!(p.authors, vec!["Ashish Vaswani", "Noam Shazeer"]);
        assert_eq!(p.abstract_text, "The dominant sequence transduction models.");
        assert_eq!(p.published, NaiveDate::from_ymd_opt(2017, 6, 12));
        assert_eq!(p.pdf_url, "https://arxiv.org/pdf/1706.03762.pdf");
    }

    #[test]
    fn date_ranges_are_inclusive() {
        let d = |s| parse_date(s).unwrap();
        assert_eq!(dates_in_range(d("2025-02-27"), d("2025-03-01")).unwrap().len(), 3);
        assert_eq!(dates_in_range(d("2025-03-01"), d("2025-03-01")).unwrap().len(), 1);
        assert!(dates_in_range(d("2025-03-02"), d("2025-03-01")).is_err());
        assert!(matches!(parse_date("03/01/2025"), Err(DigestError::InvalidDate { .. })));
    }
}
