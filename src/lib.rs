mod composite;
mod delivery;
mod document;
mod error;
mod export;
mod font;
mod interaction;
mod manifest;
mod model;
#[cfg(feature = "mupdf")]
mod mupdf_raster;
mod pdf;
mod pdf_raster;
mod perf;
mod raster;
mod session;
mod source;
mod text;
mod types;

pub use composite::{
    CompositedPage, Compositor, DEFAULT_JPEG_QUALITY, DEFAULT_PREVIEW_WIDTH, OverlayLayout, Scene,
};
pub use delivery::{
    DeliveryAdapter, DeliveryItem, DeliveryState, DeliverySummary, DirectorySaver, ItemStatus,
    Platform, SaveFile, ShareFile,
};
pub use document::{BatchMetadata, Document, DocumentId, SourceKind};
pub use error::{OverlayError, Result};
pub use export::{
    CachedPages, ExportArtifact, ExportFailure, ExportMode, ExportProgress, ExportReport,
    ExportRequest, ExportStage, Exporter, JPEG_MIME, OnDemandComposite, PDF_MIME, PageProducer,
    ProducedPages, RawSource, image_base_name, pdf_file_name,
};
pub use font::{FontRegistry, RegisteredFont};
pub use interaction::{
    DragState, DragTarget, HitTolerance, InputKind, InteractionController, OverlayTarget,
    PointerSample, SurfaceRect, hit_test, pointer_position,
};
pub use manifest::{BatchManifest, ManifestDocument, ManifestStyle, ManifestTag};
pub use model::{
    CUSTOM_TAG_COLOR, DEFAULT_TAG_FONT_SIZE, MAX_FONT_SIZE, MAX_X, MAX_Y, MIN_FONT_SIZE, MIN_X,
    MIN_Y, PartLabel, PartTag, SongFormStyle, StyleEdit, TagId, clamp_position,
};
#[cfg(feature = "mupdf")]
pub use mupdf_raster::MupdfDecoder;
pub use pdf::PdfAssembler;
pub use pdf_raster::LopdfDecoder;
pub use perf::{PerfLogger, PerfSpan};
pub use raster::{DecodedPdf, Page, PdfDecoder, Rasterizer, fit_scale, letterbox};
pub use session::{
    Advance, LoadOutcome, LoadTicket, PageState, Session, SessionOutcome, SessionStart,
};
#[cfg(feature = "http")]
pub use source::HttpFetcher;
pub use source::{LocalFetcher, SourceFetcher};
pub use types::{PageSize, PercentPoint, Rgb};

use std::path::PathBuf;
use std::sync::Arc;

/// Configured overlay engine: one font registry, canonical page size and
/// source/decoder backends shared by every session and export.
#[derive(Clone)]
pub struct SetlistOverlay {
    canonical_size: PageSize,
    fonts: Arc<FontRegistry>,
    preview_width: u32,
    jpeg_quality: u8,
    fetcher: Arc<dyn SourceFetcher>,
    decoder: Arc<dyn PdfDecoder>,
    perf: Option<PerfLogger>,
}

impl std::fmt::Debug for SetlistOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetlistOverlay")
            .field("canonical_size", &self.canonical_size)
            .field("fonts", &self.fonts.len())
            .field("preview_width", &self.preview_width)
            .field("jpeg_quality", &self.jpeg_quality)
            .field("perf", &self.perf.is_some())
            .finish()
    }
}

impl SetlistOverlay {
    pub fn builder() -> SetlistOverlayBuilder {
        SetlistOverlayBuilder::new()
    }

    pub fn canonical_size(&self) -> PageSize {
        self.canonical_size
    }

    pub fn fonts(&self) -> &FontRegistry {
        &self.fonts
    }

    pub fn rasterizer(&self) -> Rasterizer {
        Rasterizer::new(
            self.fetcher.clone(),
            self.decoder.clone(),
            self.canonical_size,
        )
    }

    pub fn compositor(&self) -> Compositor {
        Compositor::new(self.fonts.clone(), self.canonical_size)
            .with_preview_width(self.preview_width)
            .with_jpeg_quality(self.jpeg_quality)
    }

    pub fn exporter(&self) -> Exporter {
        Exporter::new(self.rasterizer(), self.compositor()).with_perf(self.perf.clone())
    }

    pub fn start_session(&self, documents: Vec<Document>) -> SessionStart {
        Session::start(documents)
    }

    /// Runs a whole session over the manifest's documents: loads each one,
    /// applies its pre-authored overlays and commits its pages. Documents
    /// without a song form are filtered out, so the outcome is empty when
    /// none carries one.
    pub async fn run_manifest(&self, manifest: &BatchManifest) -> Result<SessionOutcome> {
        let mut session = match self.start_session(manifest.documents()) {
            SessionStart::Finished(outcome) => return Ok(outcome),
            SessionStart::Active(session) => session,
        };
        let rasterizer = self.rasterizer();
        let compositor = self.compositor();
        loop {
            session.load_current_pages(&rasterizer).await;
            manifest.apply_to(&mut session)?;
            match session.advance(&compositor)? {
                Advance::Moved(_) => continue,
                Advance::Finished(outcome) => return Ok(outcome),
            }
        }
    }

    pub async fn export(
        &self,
        request: &ExportRequest,
        progress: &mut dyn FnMut(&ExportProgress),
    ) -> ExportReport {
        self.exporter().export(request, progress).await
    }

    pub fn perf(&self) -> Option<&PerfLogger> {
        self.perf.as_ref()
    }
}

#[derive(Clone)]
pub struct SetlistOverlayBuilder {
    canonical_size: PageSize,
    preview_width: u32,
    jpeg_quality: u8,
    system_fonts: bool,
    font_dirs: Vec<PathBuf>,
    font_files: Vec<PathBuf>,
    font_bytes: Vec<(Vec<u8>, Option<String>)>,
    fetcher: Option<Arc<dyn SourceFetcher>>,
    decoder: Option<Arc<dyn PdfDecoder>>,
    perf_path: Option<PathBuf>,
}

impl SetlistOverlayBuilder {
    pub fn new() -> Self {
        Self {
            canonical_size: PageSize::CANONICAL,
            preview_width: DEFAULT_PREVIEW_WIDTH,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            system_fonts: true,
            font_dirs: Vec::new(),
            font_files: Vec::new(),
            font_bytes: Vec::new(),
            fetcher: None,
            decoder: None,
            perf_path: None,
        }
    }

    pub fn canonical_size(mut self, size: PageSize) -> Self {
        self.canonical_size = size;
        self
    }

    pub fn preview_width(mut self, width: u32) -> Self {
        self.preview_width = width;
        self
    }

    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    // Off: only registered fonts are used, overlays are omitted without one.
    pub fn system_fonts(mut self, enabled: bool) -> Self {
        self.system_fonts = enabled;
        self
    }

    pub fn register_font_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_dirs.push(path.into());
        self
    }

    pub fn register_font_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_files.push(path.into());
        self
    }

    pub fn register_font_bytes(mut self, data: Vec<u8>, name: Option<&str>) -> Self {
        self.font_bytes.push((data, name.map(str::to_string)));
        self
    }

    pub fn source_fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn pdf_decoder(mut self, decoder: Arc<dyn PdfDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    // JSONL timing log for exports; a `_hot.log` summary lands next to it.
    pub fn perf_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.perf_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<SetlistOverlay> {
        if self.canonical_size.is_empty() {
            return Err(OverlayError::invalid_configuration(
                "canonical page size must be non-zero",
            ));
        }
        if self.preview_width == 0 {
            return Err(OverlayError::invalid_configuration(
                "preview width must be non-zero",
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(OverlayError::invalid_configuration(format!(
                "jpeg quality must be 1-100, got {}",
                self.jpeg_quality
            )));
        }
        let mut registry = if self.system_fonts {
            FontRegistry::new()
        } else {
            FontRegistry::isolated()
        };
        for file in &self.font_files {
            registry.register_file(file)?;
        }
        for dir in &self.font_dirs {
            registry.register_dir(dir);
        }
        for (data, name) in self.font_bytes {
            registry.register_bytes(data, name.as_deref())?;
        }
        let perf = match self.perf_path {
            Some(path) => Some(PerfLogger::new(path)?),
            None => None,
        };
        Ok(SetlistOverlay {
            canonical_size: self.canonical_size,
            fonts: Arc::new(registry),
            preview_width: self.preview_width,
            jpeg_quality: self.jpeg_quality,
            fetcher: self.fetcher.unwrap_or_else(default_fetcher),
            decoder: self.decoder.unwrap_or_else(default_decoder),
            perf,
        })
    }
}

impl Default for SetlistOverlayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http")]
fn default_fetcher() -> Arc<dyn SourceFetcher> {
    Arc::new(HttpFetcher::new(reqwest::Client::new()))
}

#[cfg(not(feature = "http"))]
fn default_fetcher() -> Arc<dyn SourceFetcher> {
    Arc::new(LocalFetcher)
}

#[cfg(feature = "mupdf")]
fn default_decoder() -> Arc<dyn PdfDecoder> {
    Arc::new(MupdfDecoder)
}

// Vector-only fallback; text in source PDFs is not drawn.
#[cfg(not(feature = "mupdf"))]
fn default_decoder() -> Arc<dyn PdfDecoder> {
    Arc::new(LopdfDecoder)
}
