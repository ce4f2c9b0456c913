//! Grounding output parsing, figure cropping and figure selection.
//!
//! Grounding OCR models tag every region they transcribe:
//!
//! ```text
//! title[[102, 40, 890, 75]] Attention Is All You Need
//! image[[120, 300, 880, 610]]
//! image_caption[[130, 615, 870, 640]] Figure 1: The Transformer architecture.
//! ```
//!
//! Some models wrap the label and box as `<|ref|>label<|/ref|><|det|>[[…]]<|/det|>`;
//! both forms are accepted. Coordinates are normalized to 0–1000 on both axes.

use crate::paper::{Figure, FigureKind};
use ab_glyph::FontVec;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// One tagged region on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrRegion {
    pub label: String,
    /// `[x1, y1, x2, y2]`, normalized to 0–1000.
    pub bbox: [u32; 4],
    pub text: String,
}

static GROUNDING_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:<\|ref\|>)?(?P<label>\w+)(?:<\|/ref\|>)?(?:<\|det\|>)?\[\[(?P<rect>[\d,\s]+)\]\](?:<\|/det\|>)?")
        .expect("valid regex")
});

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));

static CAPTION_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(fig(?:ure)?|table|tab)\.?\s*(\d+)").expect("valid regex"));

/// Split grounded OCR output into regions. Text runs from one tag to the next.
/// Tags whose box does not have four coordinates are skipped.
pub fn parse_grounding(content: &str) -> Vec<OcrRegion> {
    let matches: Vec<_> = GROUNDING_TAG.captures_iter(content).collect();
    let mut regions = Vec::with_capacity(matches.len());
    for (i, caps) in matches.iter().enumerate() {
        let (Some(whole), Some(label), Some(rect)) = (caps.get(0), caps.name("label"), caps.name("rect")) else {
            continue;
        };
        let coords: Vec<u32> = rect
            .as_str()
            .split(',')
            .filter_map(|n| n.trim().parse().ok())
            .collect();
        let &[x1, y1, x2, y2] = coords.as_slice() else {
            continue;
        };
        let text_end = matches
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(content.len());
        let text = content[whole.end()..text_end].trim().to_string();
        regions.push(OcrRegion {
            label: label.as_str().to_string(),
            bbox: [x1.min(1000), y1.min(1000), x2.min(1000), y2.min(1000)],
            text,
        });
    }
    regions
}

/// Map a grounding label onto a figure kind; None for text-like regions.
pub fn figure_kind(label: &str) -> Option<FigureKind> {
    match label.to_ascii_lowercase().as_str() {
        "image" | "figure" => Some(FigureKind::Figure),
        "table" => Some(FigureKind::Table),
        _ => None,
    }
}

fn is_caption(label: &str) -> bool {
    matches!(
        label.to_ascii_lowercase().as_str(),
        "caption" | "image_caption" | "table_caption" | "figure_caption"
    )
}

/// Drop HTML markup (tables come back as `<table>…`) and collapse whitespace.
pub fn strip_html(s: &str) -> String {
    HTML_TAG
        .replace_all(s, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Figure and table regions on one page, each paired with the caption found
/// in the next two regions, if any. `path` is left empty.
pub fn figure_candidates(regions: &[OcrRegion], page: usize) -> Vec<Figure> {
    let mut out = Vec::new();
    for (i, region) in regions.iter().enumerate() {
        let Some(kind) = figure_kind(&region.label) else {
            continue;
        };
        let caption = regions
            .iter()
            .skip(i + 1)
            .take(2)
            .find(|r| is_caption(&r.label))
            .map(|r| strip_html(&r.text))
            .unwrap_or_default();
        out.push(Figure {
            kind,
            page,
            label: region.label.clone(),
            caption,
            bbox: region.bbox,
            path: None,
            description: None,
        });
    }
    out
}

/// `"Figure 3"` / `"Table 2"` from a caption, or a positional fallback.
pub fn caption_label(figure: &Figure, ordinal: usize) -> String {
    if let Some(caps) = CAPTION_NUMBER.captures(&figure.caption) {
        let word = if caps[1].to_ascii_lowercase().starts_with("tab") { "Table" } else { "Figure" };
        return format!("{word} {}", &caps[2]);
    }
    match figure.kind {
        FigureKind::Figure => format!("Figure (p.{}, #{ordinal})", figure.page),
        FigureKind::Table => format!("Table (p.{}, #{ordinal})", figure.page),
    }
}

/// File name for a cropped region: `fig_p003_01.png`, `table_p005_02.png`.
pub fn figure_file_name(kind: FigureKind, page: usize, index: usize) -> String {
    let prefix = match kind {
        FigureKind::Figure => "fig",
        FigureKind::Table => "table",
    };
    format!("{prefix}_p{page:03}_{index:02}.png")
}

/// Convert a normalized box to pixel coordinates, clamped to the image.
/// None when the box is empty after clamping.
pub fn pixel_rect(bbox: [u32; 4], width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let scale = |v: u32, dim: u32| ((u64::from(v) * u64::from(dim)) / 1000) as u32;
    let x1 = scale(bbox[0].min(bbox[2]), width).min(width);
    let y1 = scale(bbox[1].min(bbox[3]), height).min(height);
    let x2 = scale(bbox[0].max(bbox[2]), width).min(width);
    let y2 = scale(bbox[1].max(bbox[3]), height).min(height);
    (x2 > x1 && y2 > y1).then(|| (x1, y1, x2 - x1, y2 - y1))
}

/// Crop a normalized box out of a page image.
pub fn crop(image: &DynamicImage, bbox: [u32; 4]) -> Option<DynamicImage> {
    let (w, h) = image.dimensions();
    let (x, y, cw, ch) = pixel_rect(bbox, w, h)?;
    Some(image.crop_imm(x, y, cw, ch))
}

fn label_color(label: &str) -> Rgb<u8> {
    match label.to_ascii_lowercase().as_str() {
        "title" | "sub_title" => Rgb([220, 20, 60]),
        "text" => Rgb([30, 144, 255]),
        "image" | "figure" => Rgb([34, 139, 34]),
        "table" => Rgb([255, 140, 0]),
        l if is_caption(l) => Rgb([148, 0, 211]),
        "equation" | "formula" => Rgb([0, 139, 139]),
        _ => Rgb([128, 128, 128]),
    }
}

const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/System/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// How region overlays are drawn. Without a font only the boxes are drawn.
#[derive(Clone)]
pub struct OverlayStyle {
    pub font: Option<Arc<FontVec>>,
    pub font_scale: f32,
    pub thickness: u32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            font: None,
            font_scale: 16.0,
            thickness: 3,
        }
    }
}

impl fmt::Debug for OverlayStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayStyle")
            .field("font", &self.font.as_ref().map(|_| "<loaded>"))
            .field("font_scale", &self.font_scale)
            .field("thickness", &self.thickness)
            .finish()
    }
}

impl OverlayStyle {
    /// Style with labels drawn in the font at `path`, if it parses.
    pub fn with_font_path(path: &Path) -> Option<Self> {
        let data = std::fs::read(path).ok()?;
        let font = FontVec::try_from_vec(data).ok()?;
        Some(Self {
            font: Some(Arc::new(font)),
            ..Self::default()
        })
    }

    /// Style with the first system font found, or boxes only.
    pub fn with_system_font() -> Self {
        for path in SYSTEM_FONTS {
            if let Some(style) = Self::with_font_path(Path::new(path)) {
                info!("Overlay labels use font {}", path);
                return style;
            }
        }
        debug!("No system font found, overlays will have no labels");
        Self::default()
    }
}

/// Page image with every region outlined in its label colour and, when a
/// font is available, the label written on a filled tab at the box corner.
pub fn draw_overlay(image: &DynamicImage, regions: &[OcrRegion], style: &OverlayStyle) -> RgbImage {
    let mut canvas = image.to_rgb8();
    let (w, h) = canvas.dimensions();
    for region in regions {
        let Some((x, y, rw, rh)) = pixel_rect(region.bbox, w, h) else {
            continue;
        };
        let color = label_color(&region.label);
        // Nested rectangles grow the border inwards so it stays on the page.
        for t in 0..style.thickness {
            if rw <= 2 * t || rh <= 2 * t {
                break;
            }
            let rect = Rect::at((x + t) as i32, (y + t) as i32).of_size(rw - 2 * t, rh - 2 * t);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }

        if let Some(font) = &style.font {
            let tab_h = style.font_scale.ceil() as u32 + 2;
            let tab_w = (region.label.chars().count() as f32 * style.font_scale * 0.6).ceil() as u32 + 4;
            let tab_w = tab_w.min(w - x);
            let tab_h = tab_h.min(h - y);
            if tab_w > 0 && tab_h > 0 {
                draw_filled_rect_mut(&mut canvas, Rect::at(x as i32, y as i32).of_size(tab_w, tab_h), color);
                draw_text_mut(
                    &mut canvas,
                    LABEL_TEXT_COLOR,
                    x as i32 + 2,
                    y as i32 + 1,
                    style.font_scale,
                    &**font,
                    &region.label,
                );
            }
        }
    }
    canvas
}

const ARCHITECTURE_KEYWORDS: &[&str] = &[
    "arch", "framework", "overview", "model", "structure", "pipeline", "system", "design",
];
const RESULT_KEYWORDS: &[&str] = &[
    "result", "performance", "comparison", "ablation", "accuracy", "loss", "curve", "plot",
];

/// What a selected figure illustrates in the note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FigureRole {
    Architecture,
    Result,
    Table,
    Other,
}

pub fn figure_role(figure: &Figure) -> FigureRole {
    if figure.kind == FigureKind::Table {
        return FigureRole::Table;
    }
    let caption = figure.caption.to_lowercase();
    if ARCHITECTURE_KEYWORDS.iter().any(|k| caption.contains(k)) {
        FigureRole::Architecture
    } else if RESULT_KEYWORDS.iter().any(|k| caption.contains(k)) {
        FigureRole::Result
    } else {
        FigureRole::Other
    }
}

/// Pick up to `max` figures: two architecture figures, two result figures,
/// one table, then whatever remains in document order.
pub fn select_key_figures(candidates: &[Figure], max: usize) -> Vec<Figure> {
    let by_role = |role: FigureRole| candidates.iter().enumerate().filter(move |(_, f)| figure_role(f) == role);
    let mut picked: Vec<usize> = by_role(FigureRole::Architecture)
        .take(2)
        .chain(by_role(FigureRole::Result).take(2))
        .chain(by_role(FigureRole::Table).take(1))
        .map(|(i, _)| i)
        .collect();
    for i in 0..candidates.len() {
        if !picked.contains(&i) {
            picked.push(i);
        }
    }
    picked.truncate(max);
    picked.into_iter().map(|i| candidates[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    const SAMPLE: &str = "title[[100, 20, 900, 60]] Great Paper\n\
text[[100, 80, 900, 200]] We propose things.\n\
image[[100, 300, 900, 600]]\n\
image_caption[[100, 610, 900, 640]] Figure 1: Overview of the <b>framework</b>.\n\
table[[100, 700, 900, 900]] <table><tr><td>1</td></tr></table>\n\
table_caption[[100, 905, 900, 930]] Table 2: Main results";

    #[test]
    fn parses_regions_with_text_until_next_tag() {
        let regions = parse_grounding(SAMPLE);
        assert_eq!(regions.len(), 6);
        assert_eq!(regions[0].label, "title");
        assert_eq!(regions[0].text, "Great Paper");
        assert_eq!(regions[2].bbox, [100, 300, 900, 600]);
        assert_eq!(regions[2].text, "");
    }

    #[test]
    fn parses_ref_det_form() {
        let content = "<|ref|>image<|/ref|><|det|>[[10, 20, 30, 40]]<|/det|>\n<|ref|>text<|/ref|><|det|>[[1,2,3,4]]<|/det|> hello";
        let regions = parse_grounding(content);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].label, "image");
        assert_eq!(regions[1].text, "hello");
    }

    #[test]
    fn malformed_boxes_skipped() {
        assert!(parse_grounding("image[[1, 2, 3]] x").is_empty());
        assert!(parse_grounding("plain text only").is_empty());
    }

    #[test]
    fn candidates_pick_up_following_captions() {
        let regions = parse_grounding(SAMPLE);
        let figs = figure_candidates(&regions, 4);
        assert_eq!(figs.len(), 2);
        assert_eq!(figs[0].kind, FigureKind::Figure);
        assert_eq!(figs[0].caption, "Figure 1: Overview of the framework .");
        assert_eq!(figs[1].kind, FigureKind::Table);
        assert_eq!(figs[1].caption, "Table 2: Main results");
        assert_eq!(caption_label(&figs[1], 2), "Table 2");
        assert_eq!(figs[0].page, 4);
    }

    #[test]
    fn crop_clamps_to_image() {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(200, 100, Rgba([0, 0, 0, 255])));
        let c = crop(&img, [500, 500, 1000, 1000]).unwrap();
        assert_eq!(c.dimensions(), (100, 50));
        assert!(crop(&img, [500, 500, 500, 900]).is_none());
    }

    #[test]
    fn overlay_keeps_dimensions_and_marks_border() {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 255])));
        let regions = parse_grounding("table[[100, 100, 500, 500]]");
        let out = draw_overlay(&img, &regions, &OverlayStyle::default());
        assert_eq!(out.dimensions(), (100, 100));
        assert_eq!(*out.get_pixel(10, 10), Rgb([255, 140, 0]));
        assert_eq!(*out.get_pixel(12, 30), Rgb([255, 140, 0]));
        assert_eq!(*out.get_pixel(13, 30), Rgb([255, 255, 255]));
        assert_eq!(*out.get_pixel(30, 30), Rgb([255, 255, 255]));
    }

    #[test]
    fn overlay_border_stays_inside_page_edges() {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(50, 40, Rgba([255, 255, 255, 255])));
        let regions = parse_grounding("image[[0, 0, 1000, 1000]]\ntext[[0, 0, 20, 20]]");
        let out = draw_overlay(&img, &regions, &OverlayStyle::default());
        assert_eq!(*out.get_pixel(49, 39), Rgb([34, 139, 34]));
        assert_eq!(*out.get_pixel(25, 20), Rgb([255, 255, 255]));
    }

    #[test]
    fn missing_font_file_gives_no_style() {
        assert!(OverlayStyle::with_font_path(Path::new("/nonexistent/font.ttf")).is_none());
    }

    fn fig(kind: FigureKind, caption: &str) -> Figure {
        Figure {
            kind,
            page: 1,
            label: "image".into(),
            caption: caption.into(),
            bbox: [0, 0, 10, 10],
            path: None,
            description: None,
        }
    }

    #[test]
    fn selection_prefers_architecture_results_tables() {
        let c = vec![
            fig(FigureKind::Figure, "Figure 1: teaser"),
            fig(FigureKind::Figure, "Figure 2: Ablation results"),
            fig(FigureKind::Table, "Table 1: hyper-parameters"),
            fig(FigureKind::Figure, "Figure 3: Overview of our framework"),
            fig(FigureKind::Figure, "Figure 4: Accuracy curve"),
        ];
        let picked = select_key_figures(&c, 4);
        let captions: Vec<_> = picked.iter().map(|f| f.caption.as_str()).collect();
        assert_eq!(
            captions,
            vec![
                "Figure 3: Overview of our framework",
                "Figure 2: Ablation results",
                "Figure 4: Accuracy curve",
                "Table 1: hyper-parameters",
            ]
        );
        assert_eq!(select_key_figures(&c, 0).len(), 0);
    }

    #[test]
    fn file_names() {
        assert_eq!(figure_file_name(FigureKind::Figure, 3, 1), "fig_p003_01.png");
        assert_eq!(figure_file_name(FigureKind::Table, 12, 2), "table_p012_02.png");
    }
}
