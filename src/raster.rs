use crate::document::{Document, SourceKind};
use crate::error::{OverlayError, Result};
use crate::source::SourceFetcher;
use crate::types::PageSize;
use async_trait::async_trait;
use std::sync::Arc;
use tiny_skia::{FilterQuality, Pixmap, PixmapPaint, Transform};

/// Fraction of the canonical width kept clear around letterboxed source content.
const LETTERBOX_MARGIN: f32 = 0.02;

/// One rasterized background page at the canonical size.
#[derive(Clone)]
pub struct Page {
    pub index: usize,
    pub background: Arc<Pixmap>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("width", &self.background.width())
            .field("height", &self.background.height())
            .finish()
    }
}

impl Page {
    pub fn new(index: usize, background: Pixmap) -> Self {
        Self {
            index,
            background: Arc::new(background),
        }
    }

    pub fn size(&self) -> PageSize {
        PageSize::new(self.background.width(), self.background.height())
    }
}

/// PDF decoding capability. Implementations may be backed by any rasterizer.
#[async_trait]
pub trait PdfDecoder: Send + Sync {
    async fn open(&self, bytes: Arc<Vec<u8>>) -> Result<Box<dyn DecodedPdf>>;
}

#[async_trait]
pub trait DecodedPdf: Send + Sync {
    fn page_count(&self) -> usize;

    /// Native page size in points.
    fn page_size(&self, index: usize) -> Result<(f32, f32)>;

    /// Render one page at `scale` pixels per point onto an opaque white raster.
    async fn render_page(&self, index: usize, scale: f32) -> Result<Pixmap>;
}

/// Turns a document source into canonical-size background pages.
#[derive(Clone)]
pub struct Rasterizer {
    fetcher: Arc<dyn SourceFetcher>,
    decoder: Arc<dyn PdfDecoder>,
    size: PageSize,
}

impl Rasterizer {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        decoder: Arc<dyn PdfDecoder>,
        size: PageSize,
    ) -> Self {
        Self {
            fetcher,
            decoder,
            size,
        }
    }

    pub fn page_size(&self) -> PageSize {
        self.size
    }

    pub async fn fetch_source(&self, document: &Document) -> Result<Arc<Vec<u8>>> {
        let url = document
            .source_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| OverlayError::fetch(format!("{} has no sheet source", document.id)))?;
        let bytes = self.fetcher.fetch(url).await?;
        if bytes.is_empty() {
            return Err(OverlayError::fetch(format!("{url} returned no data")));
        }
        Ok(Arc::new(bytes))
    }

    /// Decodes every page of `document`, strictly in page order.
    #[tracing::instrument(skip_all, fields(document = %document.id))]
    pub async fn load_pages(&self, document: &Document) -> Result<Vec<Page>> {
        let bytes = self.fetch_source(document).await?;
        let pages = match document.effective_source_kind() {
            Some(SourceKind::Pdf) => self.pdf_pages(bytes).await?,
            _ => vec![Page::new(0, self.image_page(&bytes)?)],
        };
        tracing::debug!(pages = pages.len(), "decoded sheet pages");
        Ok(pages)
    }

    async fn pdf_pages(&self, bytes: Arc<Vec<u8>>) -> Result<Vec<Page>> {
        let pdf = self.decoder.open(bytes).await?;
        let count = pdf.page_count();
        if count == 0 {
            return Err(OverlayError::decode("pdf has no pages"));
        }
        let mut pages = Vec::with_capacity(count);
        for index in 0..count {
            let (width_pt, height_pt) = pdf.page_size(index)?;
            let scale = fit_scale(width_pt, height_pt, self.size);
            let rendered = pdf.render_page(index, scale).await?;
            pages.push(Page::new(index, letterbox(&rendered, self.size)?));
            tokio::task::yield_now().await;
        }
        Ok(pages)
    }

    fn image_page(&self, bytes: &[u8]) -> Result<Pixmap> {
        let decoded = decode_image_to_pixmap(bytes)?;
        letterbox(&decoded, self.size)
    }

    /// Plain white page used when a document has no usable sheet.
    pub fn blank_page(&self) -> Result<Page> {
        Ok(Page::new(0, blank_pixmap(self.size)?))
    }
}

/// Scale that fits a `width × height` source inside `size` minus the margin.
pub fn fit_scale(width: f32, height: f32, size: PageSize) -> f32 {
    if !(width.is_finite() && height.is_finite()) || width <= 0.0 || height <= 0.0 {
        return 1.0;
    }
    let margin = size.width as f32 * LETTERBOX_MARGIN;
    let avail_w = (size.width as f32 - 2.0 * margin).max(1.0);
    let avail_h = (size.height as f32 - 2.0 * margin).max(1.0);
    (avail_w / width).min(avail_h / height)
}

pub(crate) fn blank_pixmap(size: PageSize) -> Result<Pixmap> {
    let mut pixmap = Pixmap::new(size.width, size.height).ok_or_else(|| {
        OverlayError::invalid_configuration(format!(
            "invalid raster size {}x{}",
            size.width, size.height
        ))
    })?;
    pixmap.fill(tiny_skia::Color::WHITE);
    Ok(pixmap)
}

/// Centers `source` on an opaque white canonical page, scaled to fit.
pub fn letterbox(source: &Pixmap, size: PageSize) -> Result<Pixmap> {
    let mut page = blank_pixmap(size)?;
    let scale = fit_scale(source.width() as f32, source.height() as f32, size);
    let drawn_w = source.width() as f32 * scale;
    let drawn_h = source.height() as f32 * scale;
    let dx = (size.width as f32 - drawn_w) / 2.0;
    let dy = (size.height as f32 - drawn_h) / 2.0;
    let paint = PixmapPaint {
        quality: FilterQuality::Bicubic,
        ..PixmapPaint::default()
    };
    page.draw_pixmap(
        0,
        0,
        source.as_ref(),
        &paint,
        Transform::from_row(scale, 0.0, 0.0, scale, dx, dy),
        None,
    );
    Ok(page)
}

pub(crate) fn decode_image_to_pixmap(data: &[u8]) -> Result<Pixmap> {
    let decoded = image::load_from_memory(data)
        .map_err(|e| OverlayError::decode(format!("image decode failed: {e}")))?;
    rgba_to_pixmap(&decoded.to_rgba8())
}

pub(crate) fn rgba_to_pixmap(rgba: &image::RgbaImage) -> Result<Pixmap> {
    let (width, height) = rgba.dimensions();
    let mut pixmap = Pixmap::new(width, height)
        .ok_or_else(|| OverlayError::decode(format!("invalid image size {width}x{height}")))?;
    let dst = pixmap.data_mut();
    for (src_px, dst_px) in rgba.as_raw().chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
        let a = src_px[3];
        dst_px[0] = premul_u8(src_px[0], a);
        dst_px[1] = premul_u8(src_px[1], a);
        dst_px[2] = premul_u8(src_px[2], a);
        dst_px[3] = a;
    }
    Ok(pixmap)
}

fn premul_u8(channel: u8, alpha: u8) -> u8 {
    let prod = (channel as u16) * (alpha as u16) + 127;
    ((prod + (prod >> 8)) >> 8) as u8
}

/// Opaque RGB pixels of a pixmap (pages are always composited onto white).
pub(crate) fn pixmap_to_rgb(pixmap: &Pixmap) -> image::RgbImage {
    let mut out = image::RgbImage::new(pixmap.width(), pixmap.height());
    for (src, dst) in pixmap.pixels().iter().zip(out.pixels_mut()) {
        let c = src.demultiply();
        let a = c.alpha() as u16;
        let blend = |v: u8| ((v as u16 * a + 255 * (255 - a) + 127) / 255) as u8;
        dst.0 = [blend(c.red()), blend(c.green()), blend(c.blue())];
    }
    out
}
