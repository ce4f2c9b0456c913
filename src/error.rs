//! Error types for the paper-digest library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`DigestError`]: **Run-fatal**: the run cannot start at all (missing
//!   credentials, invalid configuration, nothing scraped for the date).
//!   Returned as `Err(DigestError)` from [`crate::run::Pipeline::run`] before
//!   any worker pool is spawned.
//!
//! * [`StageError`]: **Per-item**: one paper failed one stage call (timeout,
//!   malformed JSON, invalid PDF). Carries its own retry classification and is
//!   recorded in the paper's error history when retries are exhausted, so one
//!   bad paper never takes the rest of the run down with it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All run-fatal errors returned by the paper-digest library.
///
/// Per-paper failures use [`StageError`] and end up in
/// [`crate::paper::Paper::errors`] rather than propagated here.
#[derive(Debug, Error)]
pub enum DigestError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The listing for the requested date was empty.
    #[error("No papers found for {date}\nThe daily listing may not be published yet; try an earlier --date.")]
    NoPapers { date: String },

    /// A date argument did not parse.
    #[error("Invalid date '{input}': expected YYYY-MM-DD")]
    InvalidDate { input: String },

    /// The listing or metadata source could not be read.
    #[error("Paper source '{source_name}' failed: {detail}\nCheck your internet connection.")]
    SourceFailed { source_name: String, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// The config file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid YAML for [`crate::config::DigestConfig`].
    #[error("Failed to parse config file '{path}': {detail}")]
    ConfigParse { path: PathBuf, detail: String },

    /// Builder or loaded-config validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Provider errors ───────────────────────────────────────────────────
    /// A provider has no usable credentials.
    #[error("Provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The library rejected our credentials during the pre-run probe.
    #[error("Authentication error from library '{provider}': {detail}\nCheck ZOTERO_API_KEY and library_id.")]
    LibraryAuth { provider: String, detail: String },

    // ── Outcome errors ────────────────────────────────────────────────────
    /// Some papers succeeded but at least one failed.
    ///
    /// Returned by [`crate::output::RunOutput::into_result`] when the caller
    /// wants to treat any paper failure as an error.
    #[error("{failed}/{total} papers failed during the run")]
    PartialFailure { failed: usize, total: usize },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the daily report.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for one paper at one stage.
///
/// The executor consults [`StageError::is_transient`] (through its
/// [`crate::pipeline::executor::RetryPolicy`]) to decide whether another
/// attempt is worth making.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum StageError {
    // ── Transient ─────────────────────────────────────────────────────────
    /// Connection reset, provider 5xx and the like.
    #[error("transient error from {provider}: {detail}")]
    Transient { provider: String, detail: String },

    /// HTTP 429.
    #[error("rate limited by {provider}")]
    RateLimited {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    /// The call did not finish within the provider timeout.
    #[error("{provider} call timed out after {secs}s")]
    Timeout { provider: String, secs: u64 },

    // ── Terminal ──────────────────────────────────────────────────────────
    /// HTTP 401/403.
    #[error("authentication rejected by {provider}: {detail}")]
    Auth { provider: String, detail: String },

    /// Any other 4xx, or a request the provider refused outright.
    #[error("{provider} rejected the request: {detail}")]
    Rejected { provider: String, detail: String },

    /// Reply arrived but could not be parsed (bad JSON, missing fields).
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Downloaded bytes are not a PDF.
    #[error("invalid PDF content: {0}")]
    InvalidContent(String),

    /// pdfium could not open or rasterise the document.
    #[error("rasterisation failed: {0}")]
    Render(String),

    /// OCR produced nothing for any page.
    #[error("no page recognized out of {total}")]
    NothingRecognized { total: usize },

    /// Local filesystem error.
    #[error("I/O error on '{path}': {detail}")]
    Io { path: String, detail: String },

    /// A stage tried to move a paper backwards.
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    /// A worker panicked or a precondition was missing.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StageError {
    /// `true` for errors where another attempt can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StageError::Transient { .. } | StageError::RateLimited { .. } | StageError::Timeout { .. }
        )
    }

    pub fn is_io(&self) -> bool {
        matches!(self, StageError::Io { .. })
    }

    pub fn io(path: &Path, err: &std::io::Error) -> Self {
        StageError::Io {
            path: path.display().to_string(),
            detail: err.to_string(),
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(provider: &str, status: reqwest::StatusCode, retry_after: Option<u64>, body: &str) -> Self {
        let provider = provider.to_string();
        let detail = format!("HTTP {}: {}", status.as_u16(), truncate_detail(body));
        match status.as_u16() {
            429 => StageError::RateLimited {
                provider,
                retry_after_secs: retry_after,
            },
            401 | 403 => StageError::Auth { provider, detail },
            408 => StageError::Transient { provider, detail },
            s if s >= 500 => StageError::Transient { provider, detail },
            _ => StageError::Rejected { provider, detail },
        }
    }

    /// Classify a transport-level reqwest error.
    pub fn from_reqwest(provider: &str, err: &reqwest::Error, timeout: Duration) -> Self {
        let provider = provider.to_string();
        if err.is_timeout() {
            StageError::Timeout {
                provider,
                secs: timeout.as_secs(),
            }
        } else if err.is_decode() {
            StageError::MalformedResponse(format!("{provider}: {err}"))
        } else if err.is_builder() {
            StageError::Rejected {
                provider,
                detail: err.to_string(),
            }
        } else {
            StageError::Transient {
                provider,
                detail: err.to_string(),
            }
        }
    }
}

/// Parse a `Retry-After` header given in whole seconds.
pub(crate) fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn truncate_detail(body: &str) -> String {
    const MAX: usize = 300;
    let body = body.trim();
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_display() {
        let e = DigestError::PartialFailure { failed: 1, total: 10 };
        let msg = e.to_string();
        assert!(msg.contains("1/10"), "got: {msg}");
    }

    #[test]
    fn no_papers_display_names_date() {
        let e = DigestError::NoPapers {
            date: "2025-03-01".into(),
        };
        assert!(e.to_string().contains("2025-03-01"));
    }

    #[test]
    fn transient_classification() {
        let timeout = StageError::Timeout {
            provider: "ocr".into(),
            secs: 120,
        };
        assert!(timeout.is_transient());
        assert!(timeout.to_string().contains("120s"));

        let malformed = StageError::MalformedResponse("no JSON object".into());
        assert!(!malformed.is_transient());
        assert!(!StageError::InvalidContent("empty".into()).is_transient());
    }

    #[test]
    fn status_mapping() {
        use reqwest::StatusCode;
        assert!(matches!(
            StageError::from_status("llm", StatusCode::TOO_MANY_REQUESTS, Some(30), ""),
            StageError::RateLimited {
                retry_after_secs: Some(30),
                ..
            }
        ));
        assert!(StageError::from_status("llm", StatusCode::BAD_GATEWAY, None, "").is_transient());
        assert!(matches!(
            StageError::from_status("llm", StatusCode::UNAUTHORIZED, None, "bad key"),
            StageError::Auth { .. }
        ));
        assert!(matches!(
            StageError::from_status("llm", StatusCode::NOT_FOUND, None, ""),
            StageError::Rejected { .. }
        ));
    }

    #[test]
    fn long_bodies_are_truncated_in_detail() {
        let body = "x".repeat(1000);
        let e = StageError::from_status("zotero", reqwest::StatusCode::BAD_REQUEST, None, &body);
        assert!(e.to_string().len() < 400);
    }

    #[test]
    fn stage_error_roundtrips_through_json() {
        let e = StageError::Io {
            path: "/tmp/x".into(),
            detail: "denied".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: StageError = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }
}
