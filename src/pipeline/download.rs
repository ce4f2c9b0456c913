//! Download stage: fetch each accepted paper's PDF into its paper directory.
//!
//! pdfium needs a real file, so the bytes are validated (`%PDF` signature)
//! and written atomically to `<paper_dir>/paper.pdf`. A previous run's file
//! is reused when it is large enough and carries the signature, which makes
//! re-running a date cheap.

use crate::config::DownloadConfig;
use crate::error::{retry_after_secs, DigestError, StageError};
use crate::layout::{write_atomic_async, StorageLayout, PDF_FILE_NAME};
use crate::paper::{Paper, ProcessingState, Stage};
use crate::pipeline::executor::{Route, StageOperation};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Files at or under this size are refetched even when present.
pub const MIN_REUSABLE_PDF_BYTES: u64 = 10 * 1024;

/// Source of PDF bytes.
#[async_trait]
pub trait PdfFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, StageError>;
}

/// Plain HTTP GET.
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: &DownloadConfig) -> Result<Self, DigestError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("paper-digest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DigestError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl PdfFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, StageError> {
        info!("Downloading PDF from: {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StageError::from_reqwest("download", &e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(response.headers());
            return Err(StageError::from_status("download", status, retry_after, url));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StageError::from_reqwest("download", &e, self.timeout))?;
        Ok(bytes.to_vec())
    }
}

/// Reject empty bodies and anything without the `%PDF` signature.
pub fn validate_pdf(bytes: &[u8]) -> Result<(), StageError> {
    if bytes.is_empty() {
        return Err(StageError::InvalidContent("empty response body".into()));
    }
    if !bytes.starts_with(b"%PDF") {
        let head: String = String::from_utf8_lossy(&bytes[..bytes.len().min(16)]).into_owned();
        return Err(StageError::InvalidContent(format!("missing %PDF signature (starts with {head:?})")));
    }
    Ok(())
}

/// True when `path` holds a PDF from an earlier run worth keeping.
pub async fn is_reusable_pdf(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    if meta.len() <= MIN_REUSABLE_PDF_BYTES {
        return false;
    }
    let mut magic = [0u8; 4];
    match tokio::fs::File::open(path).await {
        Ok(mut f) => {
            use tokio::io::AsyncReadExt;
            f.read_exact(&mut magic).await.is_ok() && &magic == b"%PDF"
        }
        Err(_) => false,
    }
}

#[derive(Debug)]
pub struct DownloadedPdf {
    pub paper_dir: PathBuf,
    pub pdf_path: PathBuf,
    pub reused: bool,
}

pub struct DownloadStage {
    fetcher: Arc<dyn PdfFetcher>,
    layout: Arc<StorageLayout>,
}

impl DownloadStage {
    pub fn new(fetcher: Arc<dyn PdfFetcher>, layout: Arc<StorageLayout>) -> Self {
        Self { fetcher, layout }
    }
}

#[async_trait]
impl StageOperation for DownloadStage {
    type Output = DownloadedPdf;

    fn stage(&self) -> Stage {
        Stage::Download
    }

    async fn process(&self, paper: &Paper) -> Result<DownloadedPdf, StageError> {
        let category = paper
            .category()
            .ok_or_else(|| StageError::Internal(format!("paper {} reached download without a category", paper.id())))?;
        let paper_dir = self.layout.paper_dir(category, &paper.meta);
        let pdf_path = paper_dir.join(PDF_FILE_NAME);

        if is_reusable_pdf(&pdf_path).await {
            debug!("{}: reusing {}", paper.id(), pdf_path.display());
            return Ok(DownloadedPdf {
                paper_dir,
                pdf_path,
                reused: true,
            });
        }

        let url = if paper.meta.pdf_url.is_empty() {
            format!("https://arxiv.org/pdf/{}.pdf", paper.id())
        } else {
            paper.meta.pdf_url.clone()
        };
        let bytes = self.fetcher.fetch(&url).await?;
        validate_pdf(&bytes)?;
        let size = bytes.len();
        write_atomic_async(pdf_path.clone(), bytes).await?;
        info!("{}: saved {} bytes to {}", paper.id(), size, pdf_path.display());

        Ok(DownloadedPdf {
            paper_dir,
            pdf_path,
            reused: false,
        })
    }

    fn apply(&self, paper: &mut Paper, out: DownloadedPdf) -> Result<Route, StageError> {
        paper
            .advance(ProcessingState::Downloaded)
            .map_err(|e| StageError::InvalidTransition(e.to_string()))?;
        paper.artifacts.paper_dir = Some(out.paper_dir);
        paper.artifacts.pdf_path = Some(out.pdf_path);
        Ok(Route::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{PaperMeta, Verdict};
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticFetcher {
        body: Vec<u8>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PdfFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.body.clone())
        }
    }

    fn accepted_paper() -> Paper {
        let mut p = Paper::new(PaperMeta::new("2503.00001", "Some Title").with_authors(["Ann Lee"]));
        p.advance(ProcessingState::Filtered { accepted: true }).unwrap();
        p.verdict = Some(Verdict {
            accepted: true,
            category: Some("Robotics".into()),
            ..Verdict::default()
        });
        p
    }

    fn stage(dir: &Path, body: Vec<u8>) -> (DownloadStage, Arc<StaticFetcher>) {
        let fetcher = Arc::new(StaticFetcher {
            body,
            calls: AtomicUsize::new(0),
        });
        let layout = Arc::new(StorageLayout::new(dir, NaiveDate::from_ymd_opt(2025, 3, 7).unwrap()));
        (DownloadStage::new(fetcher.clone(), layout), fetcher)
    }

    #[test]
    fn signature_check() {
        assert!(validate_pdf(b"%PDF-1.7 ...").is_ok());
        assert!(matches!(validate_pdf(b""), Err(StageError::InvalidContent(_))));
        assert!(matches!(validate_pdf(b"<html>"), Err(StageError::InvalidContent(_))));
    }

    #[tokio::test]
    async fn writes_pdf_into_paper_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (stage, _) = stage(dir.path(), b"%PDF-1.4 tiny".to_vec());
        let mut paper = accepted_paper();
        let out = stage.process(&paper).await.unwrap();
        assert!(!out.reused);
        assert!(out.pdf_path.ends_with("2025-03-07/Robotics/Ann_Lee_Some_Title/paper.pdf"));
        assert_eq!(std::fs::read(&out.pdf_path).unwrap(), b"%PDF-1.4 tiny");
        stage.apply(&mut paper, out).unwrap();
        assert_eq!(paper.state(), ProcessingState::Downloaded);
    }

    #[tokio::test]
    async fn reuses_existing_large_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let mut big = b"%PDF-1.4\n".to_vec();
        big.resize(MIN_REUSABLE_PDF_BYTES as usize + 1, b' ');
        let (stage, fetcher) = stage(dir.path(), b"%PDF-new".to_vec());
        let paper = accepted_paper();
        let first = stage.process(&paper).await.unwrap();
        std::fs::write(&first.pdf_path, &big).unwrap();

        let second = stage.process(&paper).await.unwrap();
        assert!(second.reused);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn html_body_is_invalid_content() {
        let dir = tempfile::tempdir().unwrap();
        let (stage, _) = stage(dir.path(), b"<html>captcha</html>".to_vec());
        let err = stage.process(&accepted_paper()).await.unwrap_err();
        assert!(matches!(err, StageError::InvalidContent(_)));
    }
}
