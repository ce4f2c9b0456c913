//! PDF rasterisation: render the first pages of a paper via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which is CPU-bound and keeps
//! thread-local state. `tokio::task::spawn_blocking` moves the work onto the
//! blocking pool so OCR calls for other papers keep flowing meanwhile.
//!
//! ## DPI and the pixel cap
//!
//! Pages are scaled by `dpi / 72` (PDF user space is 72 units per inch) and
//! then clamped so neither edge exceeds `max_rendered_pixels`. A large-format
//! page therefore never produces an image the OCR endpoint would reject.

use crate::error::StageError;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable pointing at a pdfium shared library (file or directory).
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterOptions {
    pub dpi: u32,
    pub max_pixels: u32,
    pub max_pages: usize,
}

/// One rendered page.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// 1-based page number.
    pub page_num: usize,
    pub image: DynamicImage,
}

/// Turns a PDF on disk into page images.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    /// Render up to `opts.max_pages` pages from the start of the document.
    ///
    /// Returns the rendered pages and the document's total page count.
    async fn rasterize(&self, pdf: &Path, opts: RasterOptions) -> Result<(Vec<RenderedPage>, usize), StageError>;
}

/// pdfium-backed rasterizer.
#[derive(Debug, Default, Clone)]
pub struct PdfiumRasterizer;

#[async_trait]
impl PageRasterizer for PdfiumRasterizer {
    async fn rasterize(&self, pdf: &Path, opts: RasterOptions) -> Result<(Vec<RenderedPage>, usize), StageError> {
        let path = pdf.to_path_buf();
        tokio::task::spawn_blocking(move || render_pages_blocking(&path, opts))
            .await
            .map_err(|e| StageError::Internal(format!("Render task panicked: {}", e)))?
    }
}

/// Bind pdfium from `PDFIUM_LIB_PATH` if set, else from the system.
fn bind_pdfium() -> Result<Pdfium, StageError> {
    let bindings = match std::env::var_os(PDFIUM_LIB_PATH_ENV).map(PathBuf::from) {
        Some(p) if p.is_dir() => Pdfium::bind_to_library(&Pdfium::pdfium_platform_library_name_at_path(&p)),
        Some(p) => Pdfium::bind_to_library(&p),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| {
        StageError::Render(format!(
            "failed to bind to pdfium library: {:?}; set {} to an existing libpdfium",
            e, PDFIUM_LIB_PATH_ENV
        ))
    })?;
    Ok(Pdfium::new(bindings))
}

fn render_pages_blocking(pdf_path: &Path, opts: RasterOptions) -> Result<(Vec<RenderedPage>, usize), StageError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| StageError::Render(format!("'{}' could not be opened: {:?}", pdf_path.display(), e)))?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    let wanted = total_pages.min(opts.max_pages);
    info!("PDF loaded: {} pages, rendering {}", total_pages, wanted);

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(opts.dpi as f32 / 72.0)
        .set_maximum_width(opts.max_pixels as i32)
        .set_maximum_height(opts.max_pixels as i32);

    let mut results = Vec::with_capacity(wanted);
    for idx in 0..wanted {
        let rendered = pages
            .get(idx as u16)
            .and_then(|page| page.render_with_config(&render_config).map(|bitmap| bitmap.as_image()));
        match rendered {
            Ok(image) => {
                debug!("Rendered page {} → {}x{} px", idx + 1, image.width(), image.height());
                results.push(RenderedPage {
                    page_num: idx + 1,
                    image,
                });
            }
            Err(e) => warn!("Skipping page {}: render failed: {:?}", idx + 1, e),
        }
    }

    if results.is_empty() && wanted > 0 {
        return Err(StageError::Render(format!(
            "none of {} pages of '{}' could be rendered",
            wanted,
            pdf_path.display()
        )));
    }
    Ok((results, total_pages))
}
