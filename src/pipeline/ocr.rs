//! OCR stage: rasterize a downloaded paper and recognize it page by page.
//!
//! ## Flow per paper
//!
//! ```text
//! paper.pdf ──▶ rasterize (≤ max_pages) ──▶ pages ──▶ [page_workers OCR calls]
//!                                                          │
//!        ocr/page_NNN.txt ◀── grounding parse ◀────────────┘
//!        figures/*.png   ◀── select + crop
//! ```
//!
//! Each page call runs under the OCR provider's retry policy. A page that
//! still fails is skipped with a warning; only a paper where no page was
//! recognized fails the stage. The concatenated text is cut to
//! `max_ocr_text_length` characters before it reaches analysis.

use crate::config::{AnalysisConfig, ArtifactErrorPolicy, ConcurrencyConfig, ProviderConfig};
use crate::error::StageError;
use crate::layout::{write_atomic, FIGURES_DIR, OCR_DIR};
use crate::paper::{Figure, OcrText, Paper, ProcessingState, Stage};
use crate::pipeline::encode::{encode_page, png_bytes};
use crate::pipeline::executor::{retry, RetryPolicy, Route, StageOperation};
use crate::pipeline::figures::{
    crop, draw_overlay, figure_candidates, figure_file_name, parse_grounding, select_key_figures, OcrRegion,
    OverlayStyle,
};
use crate::pipeline::llm::{ChatRequest, LanguageModel, RequestKind};
use crate::pipeline::render::{PageRasterizer, RasterOptions, RenderedPage};
use crate::prompts::OCR_PROMPT;
use async_trait::async_trait;
use futures::{stream, StreamExt};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Knobs the OCR stage reads from [`AnalysisConfig`] and [`ConcurrencyConfig`].
#[derive(Debug, Clone)]
pub struct OcrSettings {
    pub raster: RasterOptions,
    pub page_workers: usize,
    pub max_text_chars: usize,
    pub max_figures: usize,
    pub save_visualization: bool,
    pub save_cropped_figures: bool,
    pub artifact_errors: ArtifactErrorPolicy,
    pub overlay: OverlayStyle,
}

impl OcrSettings {
    pub fn new(analysis: &AnalysisConfig, concurrency: &ConcurrencyConfig) -> Self {
        Self {
            raster: RasterOptions {
                dpi: analysis.pdf_dpi,
                max_pixels: analysis.max_rendered_pixels,
                max_pages: analysis.max_pages,
            },
            page_workers: concurrency.page_workers.max(1),
            max_text_chars: analysis.max_ocr_text_length,
            max_figures: analysis.max_figures_per_paper,
            save_visualization: analysis.save_visualization,
            save_cropped_figures: analysis.save_cropped_figures,
            artifact_errors: analysis.artifact_errors,
            overlay: if analysis.save_visualization {
                OverlayStyle::with_system_font()
            } else {
                OverlayStyle::default()
            },
        }
    }
}

/// Result of one recognized page.
struct PageText {
    page_num: usize,
    content: String,
    regions: Vec<OcrRegion>,
    image: DynamicImage,
}

#[derive(Debug)]
pub struct Recognized {
    pub text: OcrText,
    pub figures: Vec<Figure>,
}

pub struct OcrStage {
    model: Arc<dyn LanguageModel>,
    rasterizer: Arc<dyn PageRasterizer>,
    provider: ProviderConfig,
    settings: OcrSettings,
    page_policy: RetryPolicy,
}

impl OcrStage {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        rasterizer: Arc<dyn PageRasterizer>,
        provider: &ProviderConfig,
        settings: OcrSettings,
    ) -> Self {
        Self {
            model,
            rasterizer,
            page_policy: provider.retry_policy(),
            provider: provider.clone(),
            settings,
        }
    }

    async fn recognize_page(&self, id: &str, page: &RenderedPage) -> Result<String, StageError> {
        let encoded = encode_page(&page.image).map_err(|e| StageError::Render(format!("page {}: {}", page.page_num, e)))?;
        let label = format!("{} page {}", id, page.page_num);
        let (content, attempts) = retry(&self.page_policy, &label, |_| {
            let request = ChatRequest::new(RequestKind::Ocr, OCR_PROMPT)
                .image(encoded.clone())
                .tuned(&self.provider);
            async move { self.model.chat(&request).await.map(|reply| reply.content) }
        })
        .await
        .map_err(|e| e.error)?;
        debug!("{}: recognized in {} attempt(s), {} chars", label, attempts, content.len());
        Ok(content)
    }
}

#[async_trait]
impl StageOperation for OcrStage {
    type Output = Recognized;

    fn stage(&self) -> Stage {
        Stage::Ocr
    }

    async fn process(&self, paper: &Paper) -> Result<Recognized, StageError> {
        let (Some(pdf_path), Some(paper_dir)) = (&paper.artifacts.pdf_path, &paper.artifacts.paper_dir) else {
            return Err(StageError::Internal(format!("paper {} reached OCR without a PDF", paper.id())));
        };
        let id = paper.id();
        let (rendered, pages_total) = self.rasterizer.rasterize(pdf_path, self.settings.raster).await?;
        let attempted = rendered.len();

        let mut pages: Vec<PageText> = stream::iter(rendered)
            .map(|page| async move {
                match self.recognize_page(id, &page).await {
                    Ok(content) => Some(PageText {
                        page_num: page.page_num,
                        regions: parse_grounding(&content),
                        content,
                        image: page.image,
                    }),
                    Err(e) => {
                        warn!("{}: skipping page {}: {}", id, page.page_num, e);
                        None
                    }
                }
            })
            .buffer_unordered(self.settings.page_workers)
            .filter_map(|p| async move { p })
            .collect()
            .await;

        if pages.is_empty() {
            return Err(StageError::NothingRecognized { total: attempted });
        }
        pages.sort_by_key(|p| p.page_num);

        let full_text = assemble_text(&pages);
        let (text, truncated) = truncate_chars(&full_text, self.settings.max_text_chars);
        if truncated {
            info!(
                "{}: OCR text truncated from {} to {} chars",
                id,
                full_text.chars().count(),
                self.settings.max_text_chars
            );
        }

        let candidates: Vec<Figure> = pages
            .iter()
            .flat_map(|p| figure_candidates(&p.regions, p.page_num))
            .collect();
        let selected = select_key_figures(&candidates, self.settings.max_figures);
        debug!("{}: {} figure candidates, {} selected", id, candidates.len(), selected.len());

        let settings = self.settings.clone();
        let dir = paper_dir.clone();
        let pages_recognized = pages.len();
        let figures = tokio::task::spawn_blocking(move || persist_artifacts(&dir, &pages, selected, &settings))
            .await
            .map_err(|e| StageError::Internal(format!("artifact task failed: {}", e)))??;

        Ok(Recognized {
            text: OcrText {
                text,
                truncated,
                pages_total,
                pages_recognized,
            },
            figures,
        })
    }

    fn apply(&self, paper: &mut Paper, out: Recognized) -> Result<Route, StageError> {
        paper
            .advance(ProcessingState::Recognized)
            .map_err(|e| StageError::InvalidTransition(e.to_string()))?;
        paper.ocr = Some(out.text);
        paper.artifacts.figures = out.figures;
        Ok(Route::Forward)
    }
}

/// Join recognized pages in page order. Grounded regions are written as
/// `[label] text`; pages without grounding tags are kept verbatim.
fn assemble_text(pages: &[PageText]) -> String {
    let mut out = String::new();
    for page in pages {
        out.push_str(&format!("\n\n=== Page {} ===\n\n", page.page_num));
        if page.regions.is_empty() {
            out.push_str(page.content.trim());
            out.push('\n');
            continue;
        }
        for region in page.regions.iter().filter(|r| !r.text.is_empty()) {
            out.push_str(&format!("[{}] {}\n", region.label, region.text));
        }
    }
    out
}

/// Cut `text` to at most `max` characters. Returns the text and whether it was cut.
pub fn truncate_chars(text: &str, max: usize) -> (String, bool) {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => (text[..byte_idx].to_string(), true),
        None => (text.to_string(), false),
    }
}

/// Write raw page text, overlays and figure crops. Returns the figures with
/// their paths filled in.
fn persist_artifacts(
    paper_dir: &Path,
    pages: &[PageText],
    selected: Vec<Figure>,
    settings: &OcrSettings,
) -> Result<Vec<Figure>, StageError> {
    let ocr_dir = paper_dir.join(OCR_DIR);
    for page in pages {
        let txt = ocr_dir.join(format!("page_{:03}.txt", page.page_num));
        artifact_result(settings, write_atomic(&txt, page.content.as_bytes()))?;

        if settings.save_visualization {
            let overlay = DynamicImage::ImageRgb8(draw_overlay(&page.image, &page.regions, &settings.overlay));
            let vis = ocr_dir.join(format!("page_{:03}_vis.png", page.page_num));
            let written = png_bytes(&overlay)
                .map_err(|e| StageError::Render(e.to_string()))
                .and_then(|bytes| write_atomic(&vis, &bytes));
            artifact_result(settings, written)?;
        }
    }

    let mut figures = Vec::with_capacity(selected.len());
    for (i, mut figure) in selected.into_iter().enumerate() {
        if settings.save_cropped_figures {
            figure.path = crop_figure(paper_dir, pages, &figure, i + 1, settings)?;
        }
        figures.push(figure);
    }
    Ok(figures)
}

fn crop_figure(
    paper_dir: &Path,
    pages: &[PageText],
    figure: &Figure,
    index: usize,
    settings: &OcrSettings,
) -> Result<Option<PathBuf>, StageError> {
    let Some(page) = pages.iter().find(|p| p.page_num == figure.page) else {
        return Ok(None);
    };
    let Some(cropped) = crop(&page.image, figure.bbox) else {
        warn!("figure on page {} has an empty box {:?}", figure.page, figure.bbox);
        return Ok(None);
    };
    let path = paper_dir
        .join(FIGURES_DIR)
        .join(figure_file_name(figure.kind, figure.page, index));
    let written = png_bytes(&cropped)
        .map_err(|e| StageError::Render(e.to_string()))
        .and_then(|bytes| write_atomic(&path, &bytes));
    match written {
        Ok(()) => Ok(Some(path)),
        Err(e) => artifact_result(settings, Err(e)).map(|_| None),
    }
}

/// Under best-effort, artifact write failures are logged and dropped;
/// under retry they surface so the stage policy can retry the paper.
fn artifact_result(settings: &OcrSettings, result: Result<(), StageError>) -> Result<(), StageError> {
    match (result, settings.artifact_errors) {
        (Ok(()), _) => Ok(()),
        (Err(e), ArtifactErrorPolicy::BestEffort) => {
            warn!("artifact write skipped: {}", e);
            Ok(())
        }
        (Err(e), ArtifactErrorPolicy::Retry) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{FigureKind, PaperMeta};
    use crate::pipeline::llm::ChatReply;
    use image::{Rgba, RgbaImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BlankPages(usize);

    #[async_trait]
    impl PageRasterizer for BlankPages {
        async fn rasterize(&self, _pdf: &Path, opts: RasterOptions) -> Result<(Vec<RenderedPage>, usize), StageError> {
            let pages = (1..=self.0.min(opts.max_pages))
                .map(|n| RenderedPage {
                    page_num: n,
                    image: DynamicImage::ImageRgba8(RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 255]))),
                })
                .collect();
            Ok((pages, self.0))
        }
    }

    struct PageModel {
        calls: AtomicUsize,
        reply: String,
        fail_all: bool,
    }

    #[async_trait]
    impl LanguageModel for PageModel {
        fn name(&self) -> &str {
            "page"
        }

        async fn chat(&self, request: &ChatRequest) -> Result<ChatReply, StageError> {
            assert_eq!(request.kind, RequestKind::Ocr);
            assert_eq!(request.images.len(), 1);
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_all {
                return Err(StageError::Transient {
                    provider: "ocr".into(),
                    detail: "503".into(),
                });
            }
            Ok(ChatReply {
                content: self.reply.clone(),
                ..ChatReply::default()
            })
        }
    }

    fn settings(max_text_chars: usize) -> OcrSettings {
        let analysis = AnalysisConfig {
            max_ocr_text_length: max_text_chars,
            ..AnalysisConfig::default()
        };
        OcrSettings::new(&analysis, &ConcurrencyConfig::default())
    }

    fn downloaded(dir: &Path) -> Paper {
        let mut p = Paper::new(PaperMeta::new("2503.00002", "Vision Paper"));
        p.artifacts.paper_dir = Some(dir.to_path_buf());
        p.artifacts.pdf_path = Some(dir.join("paper.pdf"));
        p
    }

    fn stage(model: Arc<PageModel>, pages: usize, settings: OcrSettings) -> OcrStage {
        let provider = ProviderConfig {
            max_retries: 2,
            retry_delay_ms: 1,
            ..ProviderConfig::ocr_defaults()
        };
        OcrStage::new(model, Arc::new(BlankPages(pages)), &provider, settings)
    }

    const PAGE: &str = "text[[0, 0, 1000, 100]] Some recognized words.\n\
image[[100, 200, 900, 600]]\n\
image_caption[[100, 610, 900, 650]] Figure 1: Overview of the system.";

    #[tokio::test]
    async fn recognizes_pages_and_crops_figures() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(PageModel {
            calls: AtomicUsize::new(0),
            reply: PAGE.into(),
            fail_all: false,
        });
        let s = stage(model.clone(), 2, settings(12_000));
        let out = s.process(&downloaded(dir.path())).await.unwrap();

        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        assert_eq!(out.text.pages_recognized, 2);
        assert_eq!(out.text.pages_total, 2);
        assert!(!out.text.truncated);
        assert!(out.text.text.contains("=== Page 1 ==="));
        assert!(out.text.text.find("=== Page 1").unwrap() < out.text.text.find("=== Page 2").unwrap());
        assert!(out.text.text.contains("[text] Some recognized words."));

        assert_eq!(out.figures.len(), 2);
        assert_eq!(out.figures[0].kind, FigureKind::Figure);
        let path = out.figures[0].path.as_ref().unwrap();
        assert!(path.ends_with("figures/fig_p001_01.png"));
        assert!(path.exists());
        assert!(dir.path().join("ocr/page_002.txt").exists());
        assert!(!dir.path().join("ocr/page_001_vis.png").exists());
    }

    #[tokio::test]
    async fn long_text_cut_to_exact_length() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(PageModel {
            calls: AtomicUsize::new(0),
            reply: "x".repeat(500),
            fail_all: false,
        });
        let s = stage(model, 3, settings(100));
        let out = s.process(&downloaded(dir.path())).await.unwrap();
        assert!(out.text.truncated);
        assert_eq!(out.text.text.chars().count(), 100);
    }

    #[tokio::test]
    async fn all_pages_failing_fails_the_paper() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(PageModel {
            calls: AtomicUsize::new(0),
            reply: String::new(),
            fail_all: true,
        });
        let s = stage(model.clone(), 2, settings(100));
        let err = s.process(&downloaded(dir.path())).await.unwrap_err();
        assert_eq!(err, StageError::NothingRecognized { total: 2 });
        // two pages × two attempts each
        assert_eq!(model.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), ("hé".to_string(), true));
        assert_eq!(truncate_chars("abc", 3), ("abc".to_string(), false));
        assert_eq!(truncate_chars("", 0), (String::new(), false));
    }
}
