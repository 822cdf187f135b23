//! Default PDF page rasterizer backed by MuPDF: text, fonts, shadings and
//! images all render, so engraved and typeset sheet music come out whole.
//!
//! MuPDF documents are not thread-safe. Each decoded PDF keeps only the
//! source bytes and opens a fresh `mupdf::Document` per operation under a
//! `parking_lot::Mutex`, always on a blocking thread.

use crate::error::{OverlayError, Result};
use crate::raster::{DecodedPdf, PdfDecoder, rgba_to_pixmap};
use async_trait::async_trait;
use mupdf::{Colorspace, Matrix};
use parking_lot::Mutex;
use std::sync::Arc;
use tiny_skia::Pixmap;

const PDF_MAGIC: &str = "application/pdf";
const MAX_RENDER_EDGE: f32 = 8192.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct MupdfDecoder;

#[async_trait]
impl PdfDecoder for MupdfDecoder {
    async fn open(&self, bytes: Arc<Vec<u8>>) -> Result<Box<dyn DecodedPdf>> {
        let pdf = tokio::task::spawn_blocking(move || MupdfPdf::load(bytes))
            .await
            .map_err(|e| OverlayError::decode(format!("pdf open task failed: {e}")))??;
        Ok(Box::new(pdf))
    }
}

struct MupdfSource {
    bytes: Arc<Vec<u8>>,
    lock: Mutex<()>,
}

impl MupdfSource {
    fn with_doc<R>(&self, f: impl FnOnce(&mupdf::Document) -> Result<R>) -> Result<R> {
        let _guard = self.lock.lock();
        let doc = mupdf::Document::from_bytes(&self.bytes, PDF_MAGIC).map_err(mupdf_err)?;
        f(&doc)
    }
}

struct MupdfPdf {
    source: Arc<MupdfSource>,
    /// Page bounds in points, read once at open.
    pages: Vec<(f32, f32)>,
}

impl MupdfPdf {
    fn load(bytes: Arc<Vec<u8>>) -> Result<Self> {
        let source = Arc::new(MupdfSource {
            bytes,
            lock: Mutex::new(()),
        });
        let pages = source.with_doc(|doc| {
            let count = doc.page_count().map_err(mupdf_err)?;
            (0..count)
                .map(|index| {
                    let bounds = doc.load_page(index).and_then(|p| p.bounds()).map_err(mupdf_err)?;
                    Ok((
                        (bounds.x1 - bounds.x0).abs().max(1.0),
                        (bounds.y1 - bounds.y0).abs().max(1.0),
                    ))
                })
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(Self { source, pages })
    }
}

#[async_trait]
impl DecodedPdf for MupdfPdf {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_size(&self, index: usize) -> Result<(f32, f32)> {
        self.pages
            .get(index)
            .copied()
            .ok_or_else(|| OverlayError::decode(format!("pdf page {index} out of range")))
    }

    async fn render_page(&self, index: usize, scale: f32) -> Result<Pixmap> {
        let (width, height) = self.page_size(index)?;
        let scale = clamp_scale(width, height, scale);
        let source = self.source.clone();
        tokio::task::spawn_blocking(move || {
            source.with_doc(|doc| {
                let page = doc.load_page(index as i32).map_err(mupdf_err)?;
                let matrix = Matrix::new_scale(scale, scale);
                let colorspace = Colorspace::device_rgb();
                let pixmap = page
                    .to_pixmap(&matrix, &colorspace, false, true)
                    .map_err(mupdf_err)?;
                samples_to_pixmap(
                    pixmap.width() as u32,
                    pixmap.height() as u32,
                    pixmap.n() as usize,
                    pixmap.samples(),
                )
            })
        })
        .await
        .map_err(|e| OverlayError::decode(format!("pdf render task failed: {e}")))?
    }
}

fn clamp_scale(width: f32, height: f32, scale: f32) -> f32 {
    let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
    let longest = width.max(height) * scale;
    if longest > MAX_RENDER_EDGE {
        scale * MAX_RENDER_EDGE / longest
    } else {
        scale
    }
}

/// Packs `n`-channel MuPDF samples into an opaque pixmap. Gray, RGB and
/// RGB+alpha layouts are accepted; a transparent sample is flattened onto white.
fn samples_to_pixmap(width: u32, height: u32, n: usize, samples: &[u8]) -> Result<Pixmap> {
    if n == 0 || samples.len() < width as usize * height as usize * n {
        return Err(OverlayError::decode(format!(
            "pdf raster is short: {}x{} with {n} channels but {} samples",
            width,
            height,
            samples.len()
        )));
    }
    let mut rgba = Vec::with_capacity(width as usize * height as usize * 4);
    for px in samples.chunks_exact(n).take(width as usize * height as usize) {
        let (r, g, b) = if n >= 3 {
            (px[0], px[1], px[2])
        } else {
            (px[0], px[0], px[0])
        };
        let a = match n {
            2 => px[1],
            4 => px[3],
            _ => 255,
        };
        let flat = |c: u8| ((c as u32 * a as u32 + 255 * (255 - a as u32) + 127) / 255) as u8;
        rgba.extend_from_slice(&[flat(r), flat(g), flat(b), 255]);
    }
    let image = image::RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| OverlayError::decode("pdf raster has an invalid size"))?;
    rgba_to_pixmap(&image)
}

fn mupdf_err(err: mupdf::Error) -> OverlayError {
    OverlayError::decode(format!("pdf: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf_raster::tests::pdf_with_pages;
    use lopdf::{Document as LoDocument, Object as LoObject, Stream, dictionary};

    fn rgb_at(pixmap: &Pixmap, x: u32, y: u32) -> (u8, u8, u8) {
        let px = pixmap.pixel(x, y).unwrap().demultiply();
        (px.red(), px.green(), px.blue())
    }

    fn pdf_with_helvetica(content: &[u8]) -> Vec<u8> {
        let mut doc = LoDocument::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.to_vec()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
        });
        doc.objects.insert(
            pages_id,
            LoObject::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![LoObject::Reference(page_id)],
                "Count" => 1,
                "MediaBox" => vec![0.into(), 0.into(), 300.into(), 100.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[tokio::test]
    async fn text_operators_are_drawn() {
        let bytes = pdf_with_helvetica(b"BT /F1 72 Tf 10 20 Td (HHHH) Tj ET");
        let pdf = MupdfDecoder.open(Arc::new(bytes)).await.unwrap();
        assert_eq!(pdf.page_size(0).unwrap(), (300.0, 100.0));
        let page = pdf.render_page(0, 1.0).await.unwrap();
        assert_eq!((page.width(), page.height()), (300, 100));
        let inked = page
            .pixels()
            .iter()
            .filter(|px| px.red() < 128 && px.alpha() == 255)
            .count();
        assert!(inked > 500, "expected glyph ink, got {inked} dark pixels");
        assert_eq!(rgb_at(&page, 295, 5), (255, 255, 255));
    }

    #[tokio::test]
    async fn vector_pages_render_at_the_requested_scale() {
        let bytes = pdf_with_pages(
            [0, 0, 200, 200],
            &[b"1 0 0 rg 0 0 100 100 re f", b""],
        );
        let pdf = MupdfDecoder.open(Arc::new(bytes)).await.unwrap();
        assert_eq!(pdf.page_count(), 2);
        let page = pdf.render_page(0, 0.5).await.unwrap();
        assert_eq!((page.width(), page.height()), (100, 100));
        assert_eq!(rgb_at(&page, 25, 75), (255, 0, 0));
        assert_eq!(rgb_at(&page, 75, 25), (255, 255, 255));
        assert!(pdf.render_page(2, 1.0).await.is_err());
    }

    #[tokio::test]
    async fn garbage_bytes_are_a_decode_error() {
        let err = match MupdfDecoder.open(Arc::new(b"%PDF-nope".to_vec())).await {
            Ok(_) => panic!("garbage should not open"),
            Err(err) => err,
        };
        assert!(matches!(err, OverlayError::Decode(_)));
    }

    #[test]
    fn gray_and_alpha_samples_flatten_onto_white() {
        let gray = samples_to_pixmap(1, 1, 1, &[0]).unwrap();
        assert_eq!(rgb_at(&gray, 0, 0), (0, 0, 0));
        let clear = samples_to_pixmap(1, 1, 4, &[0, 0, 0, 0]).unwrap();
        assert_eq!(rgb_at(&clear, 0, 0), (255, 255, 255));
        assert!(samples_to_pixmap(2, 2, 3, &[0; 6]).is_err());
    }

    #[test]
    fn oversized_renders_are_capped() {
        assert_eq!(clamp_scale(100.0, 100.0, 2.0), 2.0);
        assert!((clamp_scale(10_000.0, 100.0, 1.0) * 10_000.0 - MAX_RENDER_EDGE).abs() < 0.5);
        assert_eq!(clamp_scale(100.0, 100.0, f32::NAN), 1.0);
    }
}
