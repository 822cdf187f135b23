use crate::composite::{CompositedPage, Compositor, Scene};
use crate::document::{BatchMetadata, Document, SourceKind};
use crate::error::{OverlayError, Result};
use crate::pdf::PdfAssembler;
use crate::perf::PerfLogger;
use crate::raster::{Rasterizer, blank_pixmap, decode_image_to_pixmap, letterbox};
use crate::session::SessionOutcome;
use crate::types::Rgb;
use async_trait::async_trait;
use std::sync::Arc;

pub const PDF_MIME: &str = "application/pdf";
pub const JPEG_MIME: &str = "image/jpeg";
const FALLBACK_PDF_NAME: &str = "setlist.pdf";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    Pdf { cover_page: bool },
    Images,
}

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub outcome: SessionOutcome,
    pub metadata: BatchMetadata,
    pub mode: ExportMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStage {
    Cover,
    /// One page of a multi-page document was written (1-based).
    Page { page: usize, pages: usize },
    /// A document finished, successfully or not.
    Document,
    Assemble,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportProgress {
    pub current: usize,
    pub total: usize,
    pub item_label: String,
    pub stage: ExportStage,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub mime: &'static str,
}

impl std::fmt::Debug for ExportArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportArtifact")
            .field("file_name", &self.file_name)
            .field("bytes", &self.bytes.len())
            .field("mime", &self.mime)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportFailure {
    pub item_label: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    pub artifacts: Vec<ExportArtifact>,
    /// Documents the export tried to process.
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<ExportFailure>,
}

impl ExportReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.attempted == self.succeeded
    }
}

/// Final pages for one document.
#[derive(Debug, Clone)]
pub enum ProducedPages {
    Composited(Vec<CompositedPage>),
    /// The unmodified source, for documents with nothing to draw.
    Raw {
        bytes: Arc<Vec<u8>>,
        kind: SourceKind,
    },
}

/// One way of turning a document into final pages. `Ok(None)` hands the
/// document to the next producer in the chain.
#[async_trait]
pub trait PageProducer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn produce(
        &self,
        document: &Document,
        outcome: &SessionOutcome,
    ) -> Result<Option<ProducedPages>>;
}

/// Pages committed during the session.
#[derive(Debug, Default)]
pub struct CachedPages;

#[async_trait]
impl PageProducer for CachedPages {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn produce(
        &self,
        document: &Document,
        outcome: &SessionOutcome,
    ) -> Result<Option<ProducedPages>> {
        Ok(outcome
            .composited_pages
            .get(&document.id)
            .filter(|pages| !pages.is_empty())
            .map(|pages| ProducedPages::Composited(pages.clone())))
    }
}

/// Composites from the stored style and tags. A sheet that cannot be decoded
/// becomes one blank page so the overlays are still delivered.
pub struct OnDemandComposite {
    rasterizer: Rasterizer,
    compositor: Compositor,
}

impl OnDemandComposite {
    pub fn new(rasterizer: Rasterizer, compositor: Compositor) -> Self {
        Self {
            rasterizer,
            compositor,
        }
    }
}

#[async_trait]
impl PageProducer for OnDemandComposite {
    fn name(&self) -> &'static str {
        "on-demand"
    }

    async fn produce(
        &self,
        document: &Document,
        outcome: &SessionOutcome,
    ) -> Result<Option<ProducedPages>> {
        let tags = outcome
            .part_tags
            .get(&document.id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let stored_style = outcome.song_form_styles.get(&document.id);
        if stored_style.is_none() && tags.is_empty() && !document.has_song_form() {
            return Ok(None);
        }
        let style = stored_style.cloned().unwrap_or_default();
        let form_text = document.song_form_text();
        let scene = Scene {
            style: &style,
            form_text: &form_text,
            tags,
        };

        let pages = match self.rasterizer.load_pages(document).await {
            Ok(pages) => pages,
            Err(err) => {
                tracing::warn!(document = %document.id, error = %err, "no sheet; compositing over a blank page");
                let page = self.compositor.commit_page(None, &scene, 0)?;
                return Ok(Some(ProducedPages::Composited(vec![page])));
            }
        };
        let mut committed = Vec::with_capacity(pages.len());
        for page in &pages {
            committed.push(self.compositor.commit_page(Some(page), &scene, page.index)?);
            tokio::task::yield_now().await;
        }
        Ok(Some(ProducedPages::Composited(committed)))
    }
}

/// The original file, untouched.
pub struct RawSource {
    rasterizer: Rasterizer,
}

impl RawSource {
    pub fn new(rasterizer: Rasterizer) -> Self {
        Self { rasterizer }
    }
}

#[async_trait]
impl PageProducer for RawSource {
    fn name(&self) -> &'static str {
        "raw"
    }

    async fn produce(
        &self,
        document: &Document,
        _outcome: &SessionOutcome,
    ) -> Result<Option<ProducedPages>> {
        let bytes = self.rasterizer.fetch_source(document).await?;
        let kind = document
            .effective_source_kind()
            .unwrap_or(SourceKind::Image);
        Ok(Some(ProducedPages::Raw { bytes, kind }))
    }
}

/// Turns a session outcome into a PDF or a set of images.
pub struct Exporter {
    compositor: Compositor,
    producers: Vec<Box<dyn PageProducer>>,
    perf: Option<PerfLogger>,
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.producers.iter().map(|p| p.name()).collect();
        f.debug_struct("Exporter")
            .field("producers", &names)
            .field("perf", &self.perf.is_some())
            .finish()
    }
}

impl Exporter {
    /// Cache, then on-demand composite, then raw source.
    pub fn new(rasterizer: Rasterizer, compositor: Compositor) -> Self {
        let producers: Vec<Box<dyn PageProducer>> = vec![
            Box::new(CachedPages),
            Box::new(OnDemandComposite::new(rasterizer.clone(), compositor.clone())),
            Box::new(RawSource::new(rasterizer)),
        ];
        Self {
            compositor,
            producers,
            perf: None,
        }
    }

    pub fn with_producers(mut self, producers: Vec<Box<dyn PageProducer>>) -> Self {
        self.producers = producers;
        self
    }

    pub fn with_perf(mut self, perf: Option<PerfLogger>) -> Self {
        self.perf = perf;
        self
    }

    async fn produce(&self, document: &Document, outcome: &SessionOutcome) -> Result<ProducedPages> {
        let mut last_err = None;
        for producer in &self.producers {
            match producer.produce(document, outcome).await {
                Ok(Some(pages)) => {
                    tracing::debug!(document = %document.id, producer = producer.name(), "pages produced");
                    return Ok(pages);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(document = %document.id, producer = producer.name(), error = %err, "producer failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            OverlayError::composite(format!("no producer handled {}", document.id))
        }))
    }

    /// Processes documents in batch order and pages in index order. A failed
    /// document is recorded and skipped.
    #[tracing::instrument(skip_all, fields(mode = ?request.mode, documents = request.outcome.documents.len()))]
    pub async fn export(
        &self,
        request: &ExportRequest,
        progress: &mut dyn FnMut(&ExportProgress),
    ) -> ExportReport {
        let batch = self.perf.as_ref().map(|perf| perf.span("export.batch", None));
        let report = match request.mode {
            ExportMode::Pdf { cover_page } => self.export_pdf(request, cover_page, progress).await,
            ExportMode::Images => self.export_images(request, progress).await,
        };
        if let Some(perf) = &self.perf {
            perf.log_counts(
                "export",
                None,
                &[
                    ("attempted", report.attempted as u64),
                    ("succeeded", report.succeeded as u64),
                    ("failures", report.failures.len() as u64),
                    ("artifacts", report.artifacts.len() as u64),
                ],
            );
        }
        if let Some(span) = batch {
            span.finish();
        }
        tracing::info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failures.len(),
            "export finished"
        );
        report
    }

    async fn export_pdf(
        &self,
        request: &ExportRequest,
        cover_page: bool,
        progress: &mut dyn FnMut(&ExportProgress),
    ) -> ExportReport {
        let documents = &request.outcome.documents;
        let total = documents.len();
        let mut report = ExportReport {
            attempted: total,
            ..ExportReport::default()
        };
        let mut pdf = PdfAssembler::new(self.compositor.page_size()).with_title(batch_title(&request.metadata));

        if cover_page {
            let cover = self
                .render_cover(&request.metadata, documents)
                .and_then(|pixmap| self.compositor.encode_jpeg(&pixmap).map(|jpeg| (pixmap, jpeg)))
                .and_then(|(pixmap, jpeg)| pdf.push_jpeg_page(&jpeg, pixmap.width(), pixmap.height()));
            if let Err(err) = cover {
                record_failure(&mut report, "cover page", err);
            }
            progress(&ExportProgress {
                current: 0,
                total,
                item_label: "cover page".to_string(),
                stage: ExportStage::Cover,
            });
        }

        for (index, document) in documents.iter().enumerate() {
            let span = self.document_span(document);
            let current = index + 1;
            let result = match self.produce(document, &request.outcome).await {
                Ok(ProducedPages::Composited(pages)) => {
                    let count = pages.len();
                    pdf.stage_document(|pdf| {
                        for (n, page) in pages.iter().enumerate() {
                            pdf.push_jpeg_page(&page.jpeg, page.width, page.height)?;
                            emit_page(progress, current, total, document, n, count);
                        }
                        Ok(())
                    })
                }
                Ok(ProducedPages::Raw { bytes, kind }) => {
                    pdf.stage_document(|pdf| self.push_raw(pdf, &bytes, kind))
                }
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => report.succeeded += 1,
                Err(err) => record_failure(&mut report, &document.display_name, err),
            }
            finish_span(span);
            progress(&ExportProgress {
                current,
                total,
                item_label: document.display_name.clone(),
                stage: ExportStage::Document,
            });
        }

        progress(&ExportProgress {
            current: total,
            total,
            item_label: pdf_file_name(&request.metadata, total),
            stage: ExportStage::Assemble,
        });
        if pdf.page_count() == 0 {
            return report;
        }
        match pdf.finish() {
            Ok(bytes) => report.artifacts.push(ExportArtifact {
                file_name: pdf_file_name(&request.metadata, total),
                bytes,
                mime: PDF_MIME,
            }),
            Err(err) => {
                record_failure(&mut report, "pdf assembly", err);
                report.succeeded = 0;
            }
        }
        report
    }

    fn push_raw(&self, pdf: &mut PdfAssembler, bytes: &[u8], kind: SourceKind) -> Result<()> {
        match kind {
            SourceKind::Pdf => pdf.push_pdf_pages(bytes).map(|_| ()),
            SourceKind::Image => {
                let page = letterbox(&decode_image_to_pixmap(bytes)?, self.compositor.page_size())?;
                let jpeg = self.compositor.encode_jpeg(&page)?;
                pdf.push_jpeg_page(&jpeg, page.width(), page.height())
            }
        }
    }

    async fn export_images(
        &self,
        request: &ExportRequest,
        progress: &mut dyn FnMut(&ExportProgress),
    ) -> ExportReport {
        let documents = &request.outcome.documents;
        let total = documents.len();
        let custom = request.metadata.custom_file_name.as_deref();
        let mut report = ExportReport {
            attempted: total,
            ..ExportReport::default()
        };

        for (index, document) in documents.iter().enumerate() {
            let span = self.document_span(document);
            let current = index + 1;
            match self.produce(document, &request.outcome).await {
                Ok(ProducedPages::Composited(pages)) => {
                    let count = pages.len();
                    for (n, page) in pages.into_iter().enumerate() {
                        let base = image_base_name(total, index, document, custom, n, count);
                        report.artifacts.push(ExportArtifact {
                            file_name: with_extension(base, "jpg"),
                            bytes: page.jpeg,
                            mime: JPEG_MIME,
                        });
                        emit_page(progress, current, total, document, n, count);
                    }
                    report.succeeded += 1;
                }
                Ok(ProducedPages::Raw { bytes, kind }) => {
                    let base = image_base_name(total, index, document, custom, 0, 1);
                    let extension = document.source_extension();
                    report.artifacts.push(ExportArtifact {
                        file_name: with_extension(base, extension),
                        bytes: bytes.as_ref().clone(),
                        mime: raw_mime(kind, extension),
                    });
                    report.succeeded += 1;
                }
                Err(err) => record_failure(&mut report, &document.display_name, err),
            }
            finish_span(span);
            progress(&ExportProgress {
                current,
                total,
                item_label: document.display_name.clone(),
                stage: ExportStage::Document,
            });
        }
        report
    }

    fn document_span(&self, document: &Document) -> Option<crate::perf::PerfSpan> {
        self.perf
            .as_ref()
            .map(|perf| perf.span("export.document", Some(document.id.as_str())))
    }

    /// Title, date and the numbered song list on a white page.
    fn render_cover(
        &self,
        metadata: &BatchMetadata,
        documents: &[Document],
    ) -> Result<tiny_skia::Pixmap> {
        let size = self.compositor.page_size();
        let mut canvas = blank_pixmap(size)?;
        let scale = size.font_scale();
        let left = size.width as f32 * 0.1;
        let mut baseline = size.height as f32 * 0.12;

        let title = batch_title(metadata);
        let title = if title.is_empty() { "Setlist".to_string() } else { title };
        let mut drawn = self
            .compositor
            .draw_plain_text(&mut canvas, &title, left, baseline, 28.0 * scale, Rgb::BLACK);
        baseline += 40.0 * scale;

        let line_px = 14.0 * scale;
        let muted = Rgb::from_hex("#4b5563").unwrap_or(Rgb::BLACK);
        for (index, document) in documents.iter().enumerate() {
            let line = format!("{}. {}", index + 1, document.display_name);
            drawn |= self
                .compositor
                .draw_plain_text(&mut canvas, &line, left, baseline, line_px, muted);
            baseline += line_px * 1.6;
            if baseline > size.height as f32 * 0.95 {
                break;
            }
        }
        if !drawn {
            return Err(OverlayError::composite("no font available for the cover page"));
        }
        Ok(canvas)
    }
}

fn finish_span(span: Option<crate::perf::PerfSpan>) {
    if let Some(span) = span {
        span.finish();
    }
}

fn emit_page(
    progress: &mut dyn FnMut(&ExportProgress),
    current: usize,
    total: usize,
    document: &Document,
    page: usize,
    pages: usize,
) {
    if pages > 1 {
        progress(&ExportProgress {
            current,
            total,
            item_label: document.display_name.clone(),
            stage: ExportStage::Page {
                page: page + 1,
                pages,
            },
        });
    }
}

fn record_failure(report: &mut ExportReport, item: &str, err: OverlayError) {
    tracing::warn!(item, error = %err, "export item failed");
    report.failures.push(ExportFailure {
        item_label: item.to_string(),
        error: err.to_string(),
    });
}

fn batch_title(metadata: &BatchMetadata) -> String {
    [metadata.title.trim(), metadata.date.trim()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn custom_name(custom: Option<&str>) -> Option<&str> {
    custom.map(str::trim).filter(|name| !name.is_empty())
}

/// Output name of the combined PDF.
pub fn pdf_file_name(metadata: &BatchMetadata, document_count: usize) -> String {
    if document_count == 1 {
        if let Some(name) = custom_name(metadata.custom_file_name.as_deref()) {
            return with_extension(name.to_string(), "pdf");
        }
    }
    let title = batch_title(metadata);
    if title.is_empty() {
        FALLBACK_PDF_NAME.to_string()
    } else {
        format!("{title}.pdf")
    }
}

/// Image name without extension. `page` is zero-based.
pub fn image_base_name(
    document_count: usize,
    index: usize,
    document: &Document,
    custom: Option<&str>,
    page: usize,
    pages: usize,
) -> String {
    let base = if document_count == 1 {
        custom_name(custom)
            .map(|name| strip_extension(name, &["jpg", "jpeg"]).to_string())
            .unwrap_or_else(|| document.display_name.clone())
    } else {
        format!("{:02}_{}", index + 1, document.display_name)
    };
    if pages > 1 {
        format!("{base}_{}", page + 1)
    } else {
        base
    }
}

fn strip_extension<'a>(name: &'a str, extensions: &[&str]) -> &'a str {
    match name.rsplit_once('.') {
        Some((stem, ext)) if extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)) => stem,
        _ => name,
    }
}

fn with_extension(name: String, extension: &str) -> String {
    let has = name
        .rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case(extension));
    if has { name } else { format!("{name}.{extension}") }
}

fn raw_mime(kind: SourceKind, extension: &str) -> &'static str {
    match (kind, extension) {
        (SourceKind::Pdf, _) => PDF_MIME,
        (_, "png") => "image/png",
        (_, "webp") => "image/webp",
        _ => JPEG_MIME,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::font::FontRegistry;
    use crate::font::tests::fixture_fonts;
    use crate::model::{PartTag, TagId};
    use crate::pdf_raster::LopdfDecoder;
    use crate::pdf_raster::tests::pdf_with_pages;
    use crate::session::{Advance, Session, SessionStart};
    use crate::source::LocalFetcher;
    use crate::types::{PageSize, PercentPoint};
    use base64::Engine;

    const SIZE: PageSize = PageSize {
        width: 248,
        height: 351,
    };

    fn ignore(_: &ExportProgress) {}

    fn data_uri(mime: &str, bytes: &[u8]) -> String {
        format!(
            "data:{mime};base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )
    }

    fn png_uri() -> String {
        let img = image::RgbaImage::from_pixel(20, 30, image::Rgba([230, 230, 230, 255]));
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        data_uri("image/png", &out)
    }

    fn parts(fonts: FontRegistry) -> (Rasterizer, Compositor) {
        let rasterizer = Rasterizer::new(Arc::new(LocalFetcher), Arc::new(LopdfDecoder), SIZE);
        (rasterizer, Compositor::new(Arc::new(fonts), SIZE))
    }

    fn exporter() -> (Rasterizer, Compositor, Exporter) {
        let (rasterizer, compositor) = parts(FontRegistry::isolated());
        let exporter = Exporter::new(rasterizer.clone(), compositor.clone());
        (rasterizer, compositor, exporter)
    }

    fn request(outcome: SessionOutcome, mode: ExportMode) -> ExportRequest {
        ExportRequest {
            outcome,
            metadata: BatchMetadata {
                title: "Sunday".into(),
                date: "2026-10-18".into(),
                custom_file_name: None,
            },
            mode,
        }
    }

    #[test]
    fn image_names_follow_batch_size() {
        let doc = Document::new("a", "Amazing Grace");
        assert_eq!(image_base_name(1, 0, &doc, Some("Opening"), 0, 1), "Opening");
        assert_eq!(image_base_name(1, 0, &doc, Some("Opening.jpg"), 1, 2), "Opening_2");
        assert_eq!(image_base_name(1, 0, &doc, None, 0, 1), "Amazing Grace");
        assert_eq!(image_base_name(3, 1, &doc, Some("Opening"), 0, 1), "02_Amazing Grace");
        assert_eq!(image_base_name(12, 10, &doc, None, 2, 3), "11_Amazing Grace_3");
    }

    #[test]
    fn pdf_names_prefer_custom_then_title() {
        let mut meta = BatchMetadata {
            title: "Sunday".into(),
            date: "2026-10-18".into(),
            custom_file_name: Some("Just this".into()),
        };
        assert_eq!(pdf_file_name(&meta, 1), "Just this.pdf");
        assert_eq!(pdf_file_name(&meta, 2), "Sunday 2026-10-18.pdf");
        meta.title.clear();
        meta.date.clear();
        assert_eq!(pdf_file_name(&meta, 2), "setlist.pdf");
    }

    #[tokio::test]
    async fn filtered_session_exports_only_labelled_document() {
        let (rasterizer, compositor, exporter) = exporter();
        let documents = vec![
            Document::new("1", "First").with_source(png_uri(), None),
            Document::new("2", "Second")
                .with_source(png_uri(), None)
                .with_labels(["V1", "C"]),
            Document::new("3", "Third").with_source(png_uri(), None),
        ];
        let SessionStart::Active(mut session) = Session::start(documents) else {
            panic!("document 2 is labelled");
        };
        assert_eq!(session.documents().len(), 1);
        session.load_current_pages(&rasterizer).await;
        let Advance::Finished(outcome) = session.advance(&compositor).unwrap() else {
            panic!("one document finishes immediately");
        };

        let report = exporter
            .export(&request(outcome, ExportMode::Images), &mut ignore)
            .await;
        assert!(report.is_complete());
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].file_name, "Second.jpg");
        assert_eq!(report.artifacts[0].mime, JPEG_MIME);
    }

    #[tokio::test]
    async fn pdf_drops_every_page_of_a_document_that_fails_midway() {
        let (_, _, exporter) = exporter();
        let page = |index: usize, jpeg: Vec<u8>| CompositedPage {
            page_index: index,
            width: SIZE.width,
            height: SIZE.height,
            jpeg,
        };
        let jpeg = |shade: u8| {
            let img = image::RgbImage::from_pixel(SIZE.width, SIZE.height, image::Rgb([shade; 3]));
            let mut out = Vec::new();
            img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Jpeg)
                .unwrap();
            out
        };
        let good = Document::new("a", "Amazing Grace").with_labels(["C"]);
        let broken = Document::new("b", "Blessed Be").with_labels(["C"]);
        let mut outcome = SessionOutcome::unvisited(vec![good.clone(), broken.clone()]);
        outcome
            .composited_pages
            .insert(good.id.clone(), vec![page(0, jpeg(240)), page(1, jpeg(200))]);
        outcome.composited_pages.insert(
            broken.id.clone(),
            vec![page(0, jpeg(120)), page(1, jpeg(80)), page(2, Vec::new())],
        );

        let report = exporter
            .export(&request(outcome, ExportMode::Pdf { cover_page: false }), &mut ignore)
            .await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].item_label, "Blessed Be");
        let doc = lopdf::Document::load_mem(&report.artifacts[0].bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 2);
    }

    #[tokio::test]
    async fn single_tag_on_image_gives_one_centered_file() {
        let (rasterizer, compositor) = parts(fixture_fonts());
        let exporter = Exporter::new(rasterizer, compositor);
        let doc = Document::new("c", "Chorus Only").with_source(png_uri(), None);
        let mut outcome = SessionOutcome::unvisited(vec![doc.clone()]);
        outcome.part_tags.insert(
            doc.id.clone(),
            vec![PartTag::new(TagId(1), "C", PercentPoint::new(50.0, 50.0), 0)],
        );
        let mut req = request(outcome, ExportMode::Images);
        req.metadata.custom_file_name = Some("Opening".into());

        let report = exporter.export(&req, &mut ignore).await;
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].file_name, "Opening.jpg");

        let img = image::load_from_memory(&report.artifacts[0].bytes)
            .unwrap()
            .to_rgb8();
        assert_eq!((img.width(), img.height()), (SIZE.width, SIZE.height));
        let (cx, cy) = (SIZE.width / 2, SIZE.height / 2);
        let inked = |x0: u32, y0: u32, r: u32| {
            (x0 - r..=x0 + r).any(|x| {
                (y0 - r..=y0 + r).any(|y| img.get_pixel(x, y).0.iter().any(|c| *c < 150))
            })
        };
        assert!(inked(cx, cy, 8));
        assert!(!inked(20, 20, 8));
    }

    #[tokio::test]
    async fn three_page_pdf_exports_three_pages() {
        let (rasterizer, compositor, exporter) = exporter();
        let source = pdf_with_pages([0, 0, 612, 792], &[b"", b"", b""]);
        let doc = Document::new("p", "Three Pages")
            .with_source(data_uri("application/pdf", &source), Some(SourceKind::Pdf))
            .with_labels(["V1", "C"]);

        let SessionStart::Active(mut session) = Session::start(vec![doc.clone()]) else {
            panic!("labelled document");
        };
        session.load_current_pages(&rasterizer).await;
        let Advance::Finished(outcome) = session.advance(&compositor).unwrap() else {
            panic!("single document");
        };
        assert_eq!(outcome.composited_pages[&doc.id].len(), 3);

        let mut events = Vec::new();
        let report = exporter
            .export(
                &request(outcome, ExportMode::Pdf { cover_page: false }),
                &mut |p: &ExportProgress| events.push(p.stage),
            )
            .await;
        assert!(report.is_complete());
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].file_name, "Sunday 2026-10-18.pdf");
        let pdf = lopdf::Document::load_mem(&report.artifacts[0].bytes).unwrap();
        assert_eq!(pdf.get_pages().len(), 3);
        assert_eq!(
            events,
            vec![
                ExportStage::Page { page: 1, pages: 3 },
                ExportStage::Page { page: 2, pages: 3 },
                ExportStage::Page { page: 3, pages: 3 },
                ExportStage::Document,
                ExportStage::Assemble,
            ]
        );
    }

    #[tokio::test]
    async fn unvisited_documents_composite_on_demand() {
        let (_, _, exporter) = exporter();
        let source = pdf_with_pages([0, 0, 612, 792], &[b"", b""]);
        let doc = Document::new("p", "Two Pages")
            .with_source(data_uri("application/pdf", &source), None)
            .with_labels(["C"]);
        let report = exporter
            .export(
                &request(SessionOutcome::unvisited(vec![doc]), ExportMode::Images),
                &mut ignore,
            )
            .await;
        let names: Vec<&str> = report.artifacts.iter().map(|a| a.file_name.as_str()).collect();
        assert_eq!(names, vec!["Two Pages_1.jpg", "Two Pages_2.jpg"]);
    }

    #[tokio::test]
    async fn broken_sheet_with_overlays_falls_back_to_blank_page() {
        let (_, _, exporter) = exporter();
        let doc = Document::new("x", "Broken")
            .with_source("data:image/png;base64,AAAA", None)
            .with_labels(["V1"]);
        let report = exporter
            .export(
                &request(
                    SessionOutcome::unvisited(vec![doc]),
                    ExportMode::Pdf { cover_page: false },
                ),
                &mut ignore,
            )
            .await;
        assert!(report.is_complete());
        let pdf = lopdf::Document::load_mem(&report.artifacts[0].bytes).unwrap();
        assert_eq!(pdf.get_pages().len(), 1);
    }

    #[tokio::test]
    async fn plain_documents_deliver_raw_source_and_failures_are_counted() {
        let (_, _, exporter) = exporter();
        let documents = vec![
            Document::new("r", "Raw").with_source("data:image/png;base64,AAAA", None),
            Document::new("m", "Missing"),
        ];
        let mut events = 0;
        let report = exporter
            .export(
                &request(SessionOutcome::unvisited(documents), ExportMode::Images),
                &mut |_: &ExportProgress| events += 1,
            )
            .await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].item_label, "Missing");
        assert_eq!(report.artifacts[0].file_name, "01_Raw.png");
        assert_eq!(report.artifacts[0].mime, "image/png");
        assert_eq!(events, 2);
    }

    #[tokio::test]
    async fn raw_pdf_is_imported_into_the_combined_pdf() {
        let (_, _, exporter) = exporter();
        let source = pdf_with_pages([0, 0, 612, 792], &[b"", b""]);
        let documents = vec![
            Document::new("r", "Raw PDF")
                .with_source(data_uri("application/pdf", &source), Some(SourceKind::Pdf)),
            Document::new("i", "Image").with_source(png_uri(), None),
        ];
        let outcome = SessionOutcome::unvisited(documents);
        let report = exporter
            .export(&request(outcome, ExportMode::Pdf { cover_page: false }), &mut ignore)
            .await;
        assert_eq!(report.succeeded, 2);
        let pdf = lopdf::Document::load_mem(&report.artifacts[0].bytes).unwrap();
        assert_eq!(pdf.get_pages().len(), 3);
    }

    async fn export_with_cover(fonts: FontRegistry) -> ExportReport {
        let (rasterizer, compositor) = parts(fonts);
        let exporter = Exporter::new(rasterizer, compositor);
        let doc = Document::new("a", "Amazing Grace")
            .with_source(png_uri(), None)
            .with_labels(["C"]);
        exporter
            .export(
                &request(
                    SessionOutcome::unvisited(vec![doc]),
                    ExportMode::Pdf { cover_page: true },
                ),
                &mut ignore,
            )
            .await
    }

    #[tokio::test]
    async fn cover_page_is_first_when_a_font_exists() {
        let report = export_with_cover(fixture_fonts()).await;
        assert!(report.is_complete());
        let pdf = lopdf::Document::load_mem(&report.artifacts[0].bytes).unwrap();
        assert_eq!(pdf.get_pages().len(), 2);
    }

    #[tokio::test]
    async fn cover_page_without_a_font_is_a_recorded_failure() {
        let report = export_with_cover(FontRegistry::isolated()).await;
        assert_eq!(report.failures[0].item_label, "cover page");
        assert_eq!(report.succeeded, 1);
        let pdf = lopdf::Document::load_mem(&report.artifacts[0].bytes).unwrap();
        assert_eq!(pdf.get_pages().len(), 1);
    }
}
