use crate::error::{OverlayError, Result};
use crate::font::{FontRegistry, RegisteredFont};
use crate::model::{PartTag, SongFormStyle};
use crate::raster::{Page, blank_pixmap, pixmap_to_rgb};
use crate::text::{self, TextLayout};
use crate::types::{PageSize, PercentPoint, Rgb};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tiny_skia::{
    FillRule, FilterQuality, LineCap, LineJoin, Paint, Pixmap, PixmapPaint, Stroke, Transform,
};

/// Outline width relative to the pixel font size.
const OUTLINE_RATIO: f32 = 0.3;

pub const DEFAULT_PREVIEW_WIDTH: u32 = 620;
pub const DEFAULT_JPEG_QUALITY: u8 = 92;

/// Everything drawn over one document's pages.
#[derive(Debug, Clone, Copy)]
pub struct Scene<'a> {
    pub style: &'a SongFormStyle,
    pub form_text: &'a str,
    /// All tags of the document; only those on the page being drawn are used.
    pub tags: &'a [PartTag],
}

/// A committed page: the exact pixels that export will deliver.
#[derive(Clone, PartialEq, Eq)]
pub struct CompositedPage {
    pub page_index: usize,
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

impl std::fmt::Debug for CompositedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositedPage")
            .field("page_index", &self.page_index)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("jpeg_bytes", &self.jpeg.len())
            .finish()
    }
}

impl CompositedPage {
    pub fn to_data_uri(&self) -> String {
        format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&self.jpeg)
        )
    }

    /// Hex SHA-256 of the encoded JPEG.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.jpeg);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Pixel geometry of one overlay element on a page of a given size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayLayout {
    pub font_px: f32,
    pub center_x: f32,
    pub center_y: f32,
    pub left: f32,
    pub baseline: f32,
    pub width: f32,
    pub height: f32,
}

impl OverlayLayout {
    pub fn top(&self) -> f32 {
        self.center_y - self.height / 2.0
    }
}

#[derive(Debug, Clone)]
pub struct Compositor {
    fonts: Arc<FontRegistry>,
    size: PageSize,
    preview_size: PageSize,
    jpeg_quality: u8,
}

impl Compositor {
    pub fn new(fonts: Arc<FontRegistry>, size: PageSize) -> Self {
        Self {
            fonts,
            size,
            preview_size: size.with_width(DEFAULT_PREVIEW_WIDTH),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_preview_width(mut self, width: u32) -> Self {
        self.preview_size = self.size.with_width(width);
        self
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn page_size(&self) -> PageSize {
        self.size
    }

    pub fn preview_size(&self) -> PageSize {
        self.preview_size
    }

    pub fn fonts(&self) -> &FontRegistry {
        &self.fonts
    }

    /// Draws the scene for `page_index` over `background` at the canonical size.
    pub fn composite(
        &self,
        background: Option<&Page>,
        scene: &Scene<'_>,
        page_index: usize,
    ) -> Result<Pixmap> {
        self.render(background, scene, page_index, self.size)
    }

    /// Same scene at the preview size. Overlay positions and font sizes scale
    /// with the page, so the preview is the committed page scaled down.
    pub fn preview(
        &self,
        background: Option<&Page>,
        scene: &Scene<'_>,
        page_index: usize,
    ) -> Result<Pixmap> {
        self.render(background, scene, page_index, self.preview_size)
    }

    /// Composite and JPEG-encode one page.
    pub fn commit_page(
        &self,
        background: Option<&Page>,
        scene: &Scene<'_>,
        page_index: usize,
    ) -> Result<CompositedPage> {
        let pixmap = self.composite(background, scene, page_index)?;
        Ok(CompositedPage {
            page_index,
            width: pixmap.width(),
            height: pixmap.height(),
            jpeg: self.encode_jpeg(&pixmap)?,
        })
    }

    pub fn encode_jpeg(&self, pixmap: &Pixmap) -> Result<Vec<u8>> {
        let rgb = pixmap_to_rgb(pixmap);
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.jpeg_quality)
            .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
            .map_err(|e| OverlayError::encode(format!("jpeg: {e}")))?;
        Ok(out)
    }

    /// Where `text` lands when anchored at `point` on a page of `size`.
    pub fn layout_overlay(
        &self,
        text: &str,
        point: PercentPoint,
        font_size: f32,
        size: PageSize,
    ) -> Option<OverlayLayout> {
        let font = self.fonts.primary()?;
        place_text(&font, text, point, font_size, size)
            .ok()
            .map(|(_, geometry)| geometry)
    }

    fn render(
        &self,
        background: Option<&Page>,
        scene: &Scene<'_>,
        page_index: usize,
        size: PageSize,
    ) -> Result<Pixmap> {
        let mut canvas = blank_pixmap(size)?;
        if let Some(page) = background {
            let bg = page.background.as_ref();
            let sx = size.width as f32 / bg.width().max(1) as f32;
            let sy = size.height as f32 / bg.height().max(1) as f32;
            let paint = PixmapPaint {
                quality: if sx == 1.0 && sy == 1.0 {
                    FilterQuality::Nearest
                } else {
                    FilterQuality::Bicubic
                },
                ..PixmapPaint::default()
            };
            canvas.draw_pixmap(0, 0, bg.as_ref(), &paint, Transform::from_scale(sx, sy), None);
        }

        let font = self.fonts.primary();
        if !scene.form_text.trim().is_empty() {
            let style = scene.style;
            let element = Element {
                text: scene.form_text,
                point: style.position(),
                font_size: style.font_size,
                color: &style.color,
                opacity: style.opacity,
            };
            if let Err(err) = draw_element(&mut canvas, font.as_deref(), &element, size) {
                tracing::warn!(page = page_index, error = %err, "song form omitted");
            }
        }
        for tag in scene.tags.iter().filter(|tag| tag.page_index == page_index) {
            let element = Element {
                text: &tag.label,
                point: tag.position(),
                font_size: tag.font_size,
                color: &tag.color,
                opacity: tag.opacity,
            };
            if let Err(err) = draw_element(&mut canvas, font.as_deref(), &element, size) {
                tracing::warn!(page = page_index, tag = %tag.id, error = %err, "part tag omitted");
            }
        }
        Ok(canvas)
    }

    /// Left-aligned text at a pixel baseline, used for generated pages such as
    /// the export cover. Returns false when nothing could be drawn.
    pub(crate) fn draw_plain_text(
        &self,
        canvas: &mut Pixmap,
        text: &str,
        left: f32,
        baseline: f32,
        font_px: f32,
        color: Rgb,
    ) -> bool {
        let Some(font) = self.fonts.primary() else {
            return false;
        };
        let Some(layout) = text::layout_line(&font, text, font_px) else {
            return false;
        };
        let Some(path) = text::layout_path(&font, &layout, left, baseline) else {
            return false;
        };
        let mut paint = Paint::default();
        paint.set_color(color.to_sk_color(1.0));
        paint.anti_alias = true;
        canvas.fill_path(&path, &paint, FillRule::Winding, Transform::identity(), None);
        true
    }
}

struct Element<'a> {
    text: &'a str,
    point: PercentPoint,
    font_size: f32,
    color: &'a str,
    opacity: f32,
}

fn place_text(
    font: &RegisteredFont,
    text: &str,
    point: PercentPoint,
    font_size: f32,
    size: PageSize,
) -> Result<(TextLayout, OverlayLayout)> {
    if !point.is_finite() {
        return Err(OverlayError::composite(format!(
            "non-finite position ({}, {})",
            point.x, point.y
        )));
    }
    if !font_size.is_finite() || font_size <= 0.0 {
        return Err(OverlayError::composite(format!("invalid font size {font_size}")));
    }
    let font_px = font_size * size.font_scale();
    let layout = text::layout_line(font, text, font_px)
        .ok_or_else(|| OverlayError::composite(format!("no glyphs for {text:?}")))?;
    let (center_x, center_y) = point.to_pixels(size);
    let geometry = OverlayLayout {
        font_px,
        center_x,
        center_y,
        left: center_x - layout.advance / 2.0,
        baseline: center_y + (layout.ascent - layout.descent) / 2.0,
        width: layout.advance,
        height: layout.height(),
    };
    Ok((layout, geometry))
}

fn draw_element(
    canvas: &mut Pixmap,
    font: Option<&RegisteredFont>,
    element: &Element<'_>,
    size: PageSize,
) -> Result<()> {
    let font = font.ok_or_else(|| OverlayError::composite("no font available"))?;
    let color = Rgb::from_hex(element.color)
        .ok_or_else(|| OverlayError::composite(format!("unparsable color {:?}", element.color)))?;
    if !element.opacity.is_finite() {
        return Err(OverlayError::composite("non-finite opacity"));
    }
    let opacity = element.opacity.clamp(0.0, 1.0);
    if opacity == 0.0 {
        return Ok(());
    }
    let (layout, geometry) = place_text(font, element.text, element.point, element.font_size, size)?;
    let path = text::layout_path(font, &layout, geometry.left, geometry.baseline)
        .ok_or_else(|| OverlayError::composite(format!("no outlines for {:?}", element.text)))?;

    let outline = OUTLINE_RATIO * geometry.font_px;
    let bounds = path.bounds();
    let pad = outline + 2.0;
    let left = (bounds.left() - pad).floor();
    let top = (bounds.top() - pad).floor();
    let width = (bounds.right() + pad).ceil() - left;
    let height = (bounds.bottom() + pad).ceil() - top;
    let mut layer = Pixmap::new(width.max(1.0) as u32, height.max(1.0) as u32)
        .ok_or_else(|| OverlayError::composite("overlay layer has no area"))?;
    let to_layer = Transform::from_translate(-left, -top);

    let mut halo = Paint::default();
    halo.set_color(Rgb::WHITE.to_sk_color(1.0));
    halo.anti_alias = true;
    let stroke = Stroke {
        width: outline,
        line_join: LineJoin::Round,
        line_cap: LineCap::Round,
        ..Stroke::default()
    };
    layer.stroke_path(&path, &halo, &stroke, to_layer, None);

    let mut fill = Paint::default();
    fill.set_color(color.to_sk_color(1.0));
    fill.anti_alias = true;
    layer.fill_path(&path, &fill, FillRule::Winding, to_layer, None);

    let paint = PixmapPaint {
        opacity,
        ..PixmapPaint::default()
    };
    canvas.draw_pixmap(
        left as i32,
        top as i32,
        layer.as_ref(),
        &paint,
        Transform::identity(),
        None,
    );
    Ok(())
}
