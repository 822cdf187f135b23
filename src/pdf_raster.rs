//! Fallback PDF page rasterizer: a content-stream interpreter over `lopdf`
//! that paints vector paths and image XObjects with `tiny-skia`.
//!
//! Text operators are NOT drawn. Use it only for outlined or scanned
//! sheets, or when the crate is built without the `mupdf` feature;
//! `MupdfDecoder` is the default decoder otherwise.

use crate::error::{OverlayError, Result};
use crate::raster::{DecodedPdf, PdfDecoder, rgba_to_pixmap};
use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary as LoDictionary, Document as LoDocument, Object as LoObject, ObjectId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tiny_skia::{
    FillRule, FilterQuality, LineCap, LineJoin, Paint, PathBuilder, Pixmap, PixmapPaint, Stroke,
    Transform,
};
use tokio::sync::{mpsc, oneshot};

/// A4 portrait, used when a page tree carries no usable MediaBox.
const FALLBACK_MEDIA_BOX: PageBox = PageBox {
    x0: 0.0,
    y0: 0.0,
    x1: 595.0,
    y1: 842.0,
};

const MAX_RENDER_EDGE: f32 = 8192.0;

/// Vector-only decoder. See the module docs for what it skips.
#[derive(Debug, Clone, Copy, Default)]
pub struct LopdfDecoder;

#[async_trait]
impl PdfDecoder for LopdfDecoder {
    async fn open(&self, bytes: Arc<Vec<u8>>) -> Result<Box<dyn DecodedPdf>> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("setlist-lopdf-render".to_owned())
            .spawn(move || serve_document(bytes, ready_tx, jobs_rx))
            .map_err(|e| OverlayError::decode(format!("pdf render worker failed to start: {e}")))?;
        let pages = ready_rx
            .await
            .map_err(|_| OverlayError::decode("pdf render worker exited during open"))??;
        Ok(Box::new(LopdfPdf { pages, jobs: jobs_tx }))
    }
}

struct RenderJob {
    index: usize,
    scale: f32,
    reply: oneshot::Sender<Result<Pixmap>>,
}

/// Handle to a parsed document. The object graph is parsed once and owned by
/// one worker thread; renders are queued to it and the worker exits when this
/// handle drops.
struct LopdfPdf {
    pages: Vec<PageBox>,
    jobs: mpsc::UnboundedSender<RenderJob>,
}

fn serve_document(
    bytes: Arc<Vec<u8>>,
    ready: oneshot::Sender<Result<Vec<PageBox>>>,
    mut jobs: mpsc::UnboundedReceiver<RenderJob>,
) {
    let doc = match LoDocument::load_mem(&bytes) {
        Ok(doc) => doc,
        Err(err) => {
            let _ = ready.send(Err(decode_err(err)));
            return;
        }
    };
    drop(bytes);
    let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
    let boxes: Vec<PageBox> = page_ids
        .iter()
        .map(|&id| media_box_for_page(&doc, id))
        .collect();
    if ready.send(Ok(boxes.clone())).is_err() {
        return;
    }
    while let Some(job) = jobs.blocking_recv() {
        let result = match (page_ids.get(job.index), boxes.get(job.index)) {
            (Some(&id), Some(&media)) => render_page(&doc, id, media, job.scale),
            _ => Err(OverlayError::decode(format!("pdf page {} out of range", job.index))),
        };
        let _ = job.reply.send(result);
    }
}

#[async_trait]
impl DecodedPdf for LopdfPdf {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_size(&self, index: usize) -> Result<(f32, f32)> {
        self.pages
            .get(index)
            .map(|media| (media.width(), media.height()))
            .ok_or_else(|| OverlayError::decode(format!("pdf page {index} out of range")))
    }

    async fn render_page(&self, index: usize, scale: f32) -> Result<Pixmap> {
        if index >= self.pages.len() {
            return Err(OverlayError::decode(format!("pdf page {index} out of range")));
        }
        let (reply, rendered) = oneshot::channel();
        self.jobs
            .send(RenderJob { index, scale, reply })
            .map_err(|_| OverlayError::decode("pdf render worker has exited"))?;
        rendered
            .await
            .map_err(|_| OverlayError::decode("pdf render worker dropped the page"))?
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PageBox {
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
}

impl PageBox {
    fn width(&self) -> f32 {
        (self.x1 - self.x0).abs().max(1.0)
    }

    fn height(&self) -> f32 {
        (self.y1 - self.y0).abs().max(1.0)
    }
}

/// Affine matrix in PDF row-vector convention: `[a b 0; c d 0; e f 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix {
    a: f32,
    b: f32,
    c: f32,
    d: f32,
    e: f32,
    f: f32,
}

impl Matrix {
    fn new(a: f32, b: f32, c: f32, d: f32, e: f32, f: f32) -> Self {
        Self { a, b, c, d, e, f }
    }

    /// `self` applied first, then `rhs`.
    fn then(self, rhs: Self) -> Self {
        Self {
            a: self.a * rhs.a + self.b * rhs.c,
            b: self.a * rhs.b + self.b * rhs.d,
            c: self.c * rhs.a + self.d * rhs.c,
            d: self.c * rhs.b + self.d * rhs.d,
            e: self.e * rhs.a + self.f * rhs.c + rhs.e,
            f: self.e * rhs.b + self.f * rhs.d + rhs.f,
        }
    }

    fn apply(self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.e,
            self.b * x + self.d * y + self.f,
        )
    }

    fn mean_scale(self) -> f32 {
        (self.a * self.d - self.b * self.c).abs().sqrt()
    }

    fn to_transform(self) -> Transform {
        Transform::from_row(self.a, self.b, self.c, self.d, self.e, self.f)
    }
}

#[derive(Debug, Clone)]
struct GraphicsState {
    ctm: Matrix,
    fill: [f32; 3],
    stroke: [f32; 3],
    fill_alpha: f32,
    stroke_alpha: f32,
    line_width: f32,
    line_cap: LineCap,
    line_join: LineJoin,
}

impl GraphicsState {
    fn new(ctm: Matrix) -> Self {
        Self {
            ctm,
            fill: [0.0; 3],
            stroke: [0.0; 3],
            fill_alpha: 1.0,
            stroke_alpha: 1.0,
            line_width: 1.0,
            line_cap: LineCap::Butt,
            line_join: LineJoin::Miter,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Resources {
    xobjects: HashMap<String, ObjectId>,
    alpha: HashMap<String, (f32, f32)>,
}

impl Resources {
    fn merged(&self, child: &Resources) -> Resources {
        let mut out = self.clone();
        out.xobjects
            .extend(child.xobjects.iter().map(|(k, v)| (k.clone(), *v)));
        out.alpha.extend(child.alpha.iter().map(|(k, v)| (k.clone(), *v)));
        out
    }
}

struct PageRenderer<'a> {
    doc: &'a LoDocument,
    pixmap: Pixmap,
    path: PathBuilder,
    current: (f32, f32),
    images: HashMap<ObjectId, Option<Arc<Pixmap>>>,
    active_forms: HashSet<ObjectId>,
}

fn render_page(doc: &LoDocument, page_id: ObjectId, media: PageBox, scale: f32) -> Result<Pixmap> {
    let scale = if scale.is_finite() && scale > 0.0 {
        scale
    } else {
        1.0
    };
    let width = (media.width() * scale).ceil().clamp(1.0, MAX_RENDER_EDGE) as u32;
    let height = (media.height() * scale).ceil().clamp(1.0, MAX_RENDER_EDGE) as u32;
    let mut pixmap = Pixmap::new(width, height)
        .ok_or_else(|| OverlayError::decode(format!("invalid pdf raster size {width}x{height}")))?;
    pixmap.fill(tiny_skia::Color::WHITE);

    let page_dict = doc
        .get_object(page_id)
        .and_then(LoObject::as_dict)
        .map_err(decode_err)?;
    let resources = match page_dict.get(b"Resources") {
        Ok(obj) => resources_from_object(doc, obj),
        Err(_) => inherited_resources(doc, page_dict),
    };
    let content = doc.get_page_content(page_id).map_err(decode_err)?;
    let content = Content::decode(&content).map_err(decode_err)?;

    let device = Matrix::new(
        scale,
        0.0,
        0.0,
        -scale,
        -media.x0 * scale,
        media.y1.max(media.y0) * scale,
    );
    let mut renderer = PageRenderer {
        doc,
        pixmap,
        path: PathBuilder::new(),
        current: (0.0, 0.0),
        images: HashMap::new(),
        active_forms: HashSet::new(),
    };
    let mut state = GraphicsState::new(device);
    renderer.run(&content.operations, &resources, &mut state);
    Ok(renderer.pixmap)
}

impl PageRenderer<'_> {
    fn run(&mut self, operations: &[Operation], resources: &Resources, state: &mut GraphicsState) {
        let mut stack: Vec<GraphicsState> = Vec::new();
        for op in operations {
            match op.operator.as_str() {
                "q" => stack.push(state.clone()),
                "Q" => {
                    if let Some(prev) = stack.pop() {
                        *state = prev;
                    }
                }
                "cm" => {
                    if let Some([a, b, c, d, e, f]) = op_f32_6(op) {
                        state.ctm = Matrix::new(a, b, c, d, e, f).then(state.ctm);
                    }
                }
                "w" => {
                    if let Some(width) = op_f32(op, 0) {
                        state.line_width = width.max(0.0);
                    }
                }
                "J" => {
                    state.line_cap = match op_i64(op, 0) {
                        Some(1) => LineCap::Round,
                        Some(2) => LineCap::Square,
                        _ => LineCap::Butt,
                    };
                }
                "j" => {
                    state.line_join = match op_i64(op, 0) {
                        Some(1) => LineJoin::Round,
                        Some(2) => LineJoin::Bevel,
                        _ => LineJoin::Miter,
                    };
                }
                "gs" => {
                    if let Some(&(fill, stroke)) =
                        op_name(op, 0).and_then(|name| resources.alpha.get(&name))
                    {
                        state.fill_alpha = fill;
                        state.stroke_alpha = stroke;
                    }
                }
                "g" | "rg" | "k" | "sc" | "scn" => {
                    if let Some(rgb) = color_operands(op) {
                        state.fill = rgb;
                    }
                }
                "G" | "RG" | "K" | "SC" | "SCN" => {
                    if let Some(rgb) = color_operands(op) {
                        state.stroke = rgb;
                    }
                }
                "m" => {
                    if let Some([x, y]) = op_f32_2(op) {
                        let (x, y) = state.ctm.apply(x, y);
                        self.path.move_to(x, y);
                        self.current = (x, y);
                    }
                }
                "l" => {
                    if let Some([x, y]) = op_f32_2(op) {
                        let (x, y) = state.ctm.apply(x, y);
                        self.path.line_to(x, y);
                        self.current = (x, y);
                    }
                }
                "c" => {
                    if let Some([x1, y1, x2, y2, x, y]) = op_f32_6(op) {
                        let (x1, y1) = state.ctm.apply(x1, y1);
                        let (x2, y2) = state.ctm.apply(x2, y2);
                        let (x, y) = state.ctm.apply(x, y);
                        self.path.cubic_to(x1, y1, x2, y2, x, y);
                        self.current = (x, y);
                    }
                }
                "v" => {
                    if let Some([x2, y2, x, y]) = op_f32_4(op) {
                        let (x1, y1) = self.current;
                        let (x2, y2) = state.ctm.apply(x2, y2);
                        let (x, y) = state.ctm.apply(x, y);
                        self.path.cubic_to(x1, y1, x2, y2, x, y);
                        self.current = (x, y);
                    }
                }
                "y" => {
                    if let Some([x1, y1, x, y]) = op_f32_4(op) {
                        let (x1, y1) = state.ctm.apply(x1, y1);
                        let (x, y) = state.ctm.apply(x, y);
                        self.path.cubic_to(x1, y1, x, y, x, y);
                        self.current = (x, y);
                    }
                }
                "re" => {
                    if let Some([x, y, w, h]) = op_f32_4(op) {
                        let corners = [(x, y), (x + w, y), (x + w, y + h), (x, y + h)];
                        for (idx, (cx, cy)) in corners.into_iter().enumerate() {
                            let (dx, dy) = state.ctm.apply(cx, cy);
                            if idx == 0 {
                                self.path.move_to(dx, dy);
                                self.current = (dx, dy);
                            } else {
                                self.path.line_to(dx, dy);
                            }
                        }
                        self.path.close();
                    }
                }
                "h" => self.path.close(),
                "f" | "F" => self.paint(state, Some(FillRule::Winding), false),
                "f*" => self.paint(state, Some(FillRule::EvenOdd), false),
                "S" => self.paint(state, None, true),
                "s" => {
                    self.path.close();
                    self.paint(state, None, true);
                }
                "B" => self.paint(state, Some(FillRule::Winding), true),
                "B*" => self.paint(state, Some(FillRule::EvenOdd), true),
                "b" => {
                    self.path.close();
                    self.paint(state, Some(FillRule::Winding), true);
                }
                "b*" => {
                    self.path.close();
                    self.paint(state, Some(FillRule::EvenOdd), true);
                }
                "n" => self.path = PathBuilder::new(),
                "Do" => {
                    if let Some(&id) = op_name(op, 0).and_then(|name| resources.xobjects.get(&name))
                    {
                        self.draw_xobject(id, resources, state);
                    }
                }
                _ => {}
            }
        }
    }

    fn paint(&mut self, state: &GraphicsState, fill: Option<FillRule>, stroke: bool) {
        let builder = std::mem::replace(&mut self.path, PathBuilder::new());
        let Some(path) = builder.finish() else {
            return;
        };
        if let Some(rule) = fill {
            let paint = solid_paint(state.fill, state.fill_alpha);
            self.pixmap
                .fill_path(&path, &paint, rule, Transform::identity(), None);
        }
        if stroke {
            let paint = solid_paint(state.stroke, state.stroke_alpha);
            let stroke = Stroke {
                // Zero-width lines are the thinnest visible line.
                width: (state.line_width * state.ctm.mean_scale()).max(0.5),
                line_cap: state.line_cap,
                line_join: state.line_join,
                ..Stroke::default()
            };
            self.pixmap
                .stroke_path(&path, &paint, &stroke, Transform::identity(), None);
        }
    }

    fn draw_xobject(&mut self, id: ObjectId, parent: &Resources, state: &GraphicsState) {
        let doc = self.doc;
        let Ok(stream) = doc.get_object(id).and_then(LoObject::as_stream) else {
            return;
        };
        let subtype = stream
            .dict
            .get(b"Subtype")
            .and_then(LoObject::as_name)
            .unwrap_or_default();

        match subtype {
            b"Form" => {
                if !self.active_forms.insert(id) {
                    return;
                }
                let operations = stream
                    .get_plain_content()
                    .ok()
                    .and_then(|bytes| Content::decode(&bytes).ok())
                    .map(|content| content.operations)
                    .unwrap_or_default();
                let own = match stream.dict.get(b"Resources") {
                    Ok(obj) => resources_from_object(doc, obj),
                    Err(_) => Resources::default(),
                };
                let merged = parent.merged(&own);
                let form_matrix = stream
                    .dict
                    .get(b"Matrix")
                    .ok()
                    .and_then(parse_matrix)
                    .unwrap_or(Matrix::new(1.0, 0.0, 0.0, 1.0, 0.0, 0.0));
                let mut nested = state.clone();
                nested.ctm = form_matrix.then(state.ctm);
                self.run(&operations, &merged, &mut nested);
                self.active_forms.remove(&id);
            }
            b"Image" => {
                let image = self
                    .images
                    .entry(id)
                    .or_insert_with(|| decode_image_xobject(doc, stream).map(Arc::new))
                    .clone();
                let Some(image) = image else {
                    tracing::debug!(object = ?id, "skipping undecodable image xobject");
                    return;
                };
                let (w, h) = (image.width() as f32, image.height() as f32);
                // Image space maps the unit square with row 0 at the top.
                let unit = Matrix::new(1.0 / w, 0.0, 0.0, -1.0 / h, 0.0, 1.0);
                let paint = PixmapPaint {
                    quality: FilterQuality::Bilinear,
                    opacity: state.fill_alpha,
                    ..PixmapPaint::default()
                };
                self.pixmap.draw_pixmap(
                    0,
                    0,
                    (*image).as_ref(),
                    &paint,
                    unit.then(state.ctm).to_transform(),
                    None,
                );
            }
            _ => {}
        }
    }
}

fn solid_paint(rgb: [f32; 3], alpha: f32) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color(
        tiny_skia::Color::from_rgba(
            rgb[0].clamp(0.0, 1.0),
            rgb[1].clamp(0.0, 1.0),
            rgb[2].clamp(0.0, 1.0),
            alpha.clamp(0.0, 1.0),
        )
        .unwrap_or(tiny_skia::Color::BLACK),
    );
    paint.anti_alias = true;
    paint
}

/// Gray, RGB or CMYK by operand count; pattern names are ignored.
fn color_operands(op: &Operation) -> Option<[f32; 3]> {
    let values: Vec<f32> = op.operands.iter().filter_map(obj_to_f32).collect();
    match values.as_slice() {
        [gray] => Some([*gray; 3]),
        [r, g, b] => Some([*r, *g, *b]),
        [c, m, y, k] => {
            let (r, g, b) = cmyk_to_rgb(*c, *m, *y, *k);
            Some([r, g, b])
        }
        _ => None,
    }
}

fn media_box_for_page(doc: &LoDocument, mut id: ObjectId) -> PageBox {
    let mut seen = HashSet::new();
    while seen.insert(id) {
        let Ok(dict) = doc.get_object(id).and_then(LoObject::as_dict) else {
            break;
        };
        let media = dict
            .get(b"MediaBox")
            .ok()
            .and_then(|obj| resolve_object(doc, obj))
            .and_then(|obj| obj.as_array().ok())
            .and_then(|arr| parse_page_box(arr));
        if let Some(media) = media {
            return media;
        }
        match dict.get(b"Parent").and_then(LoObject::as_reference) {
            Ok(parent) => id = parent,
            Err(_) => break,
        }
    }
    FALLBACK_MEDIA_BOX
}

fn parse_page_box(arr: &[LoObject]) -> Option<PageBox> {
    if arr.len() < 4 {
        return None;
    }
    let x0 = obj_to_f32(&arr[0])?;
    let y0 = obj_to_f32(&arr[1])?;
    let x1 = obj_to_f32(&arr[2])?;
    let y1 = obj_to_f32(&arr[3])?;
    Some(PageBox {
        x0: x0.min(x1),
        y0: y0.min(y1),
        x1: x0.max(x1),
        y1: y0.max(y1),
    })
}

fn inherited_resources(doc: &LoDocument, page_dict: &LoDictionary) -> Resources {
    let mut parent = page_dict.get(b"Parent").and_then(LoObject::as_reference).ok();
    let mut seen = HashSet::new();
    while let Some(id) = parent.filter(|id| seen.insert(*id)) {
        let Ok(dict) = doc.get_object(id).and_then(LoObject::as_dict) else {
            break;
        };
        if let Ok(obj) = dict.get(b"Resources") {
            return resources_from_object(doc, obj);
        }
        parent = dict.get(b"Parent").and_then(LoObject::as_reference).ok();
    }
    Resources::default()
}

fn resources_from_object(doc: &LoDocument, obj: &LoObject) -> Resources {
    let mut out = Resources::default();
    let Some(dict) = resolve_object(doc, obj).and_then(|o| o.as_dict().ok()) else {
        return out;
    };

    if let Some(xobjects) = dict
        .get(b"XObject")
        .ok()
        .and_then(|o| resolve_object(doc, o))
        .and_then(|o| o.as_dict().ok())
    {
        for (name, value) in xobjects.iter() {
            if let Ok(id) = value.as_reference() {
                out.xobjects
                    .insert(String::from_utf8_lossy(name).into_owned(), id);
            }
        }
    }

    if let Some(states) = dict
        .get(b"ExtGState")
        .ok()
        .and_then(|o| resolve_object(doc, o))
        .and_then(|o| o.as_dict().ok())
    {
        for (name, value) in states.iter() {
            let Some(gs) = resolve_object(doc, value).and_then(|o| o.as_dict().ok()) else {
                continue;
            };
            let alpha = |key: &[u8]| {
                gs.get(key)
                    .ok()
                    .and_then(obj_to_f32)
                    .unwrap_or(1.0)
                    .clamp(0.0, 1.0)
            };
            out.alpha.insert(
                String::from_utf8_lossy(name).into_owned(),
                (alpha(b"ca"), alpha(b"CA")),
            );
        }
    }
    out
}

#[derive(Debug, Clone, Copy)]
enum Components {
    Gray,
    Rgb,
    Cmyk,
}

impl Components {
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"DeviceGray" | b"CalGray" | b"G" => Some(Self::Gray),
            b"DeviceRGB" | b"CalRGB" | b"RGB" => Some(Self::Rgb),
            b"DeviceCMYK" | b"CMYK" => Some(Self::Cmyk),
            _ => None,
        }
    }

    fn channels(self) -> usize {
        match self {
            Self::Gray => 1,
            Self::Rgb => 3,
            Self::Cmyk => 4,
        }
    }

    fn to_rgb(self, px: &[u8]) -> Option<[u8; 3]> {
        match self {
            Self::Gray => px.first().map(|v| [*v; 3]),
            Self::Rgb => Some([*px.first()?, *px.get(1)?, *px.get(2)?]),
            Self::Cmyk => {
                let unit = |idx: usize| px.get(idx).map(|v| *v as f32 / 255.0);
                let (r, g, b) = cmyk_to_rgb(unit(0)?, unit(1)?, unit(2)?, unit(3)?);
                let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
                Some([to_u8(r), to_u8(g), to_u8(b)])
            }
        }
    }
}

enum ImageColorSpace {
    Direct(Components),
    Indexed { base: Components, lookup: Vec<u8> },
}

fn image_color_space(doc: &LoDocument, obj: &LoObject) -> Option<ImageColorSpace> {
    match resolve_object(doc, obj)? {
        LoObject::Name(name) => Components::from_name(name).map(ImageColorSpace::Direct),
        LoObject::Array(arr) => {
            let head = resolve_object(doc, arr.first()?)?.as_name().ok()?;
            if let Some(direct) = Components::from_name(head) {
                return Some(ImageColorSpace::Direct(direct));
            }
            match head {
                b"ICCBased" => {
                    let stream = resolve_object(doc, arr.get(1)?)?.as_stream().ok()?;
                    let n = stream.dict.get(b"N").ok().and_then(|o| o.as_i64().ok());
                    match n {
                        Some(1) => Some(ImageColorSpace::Direct(Components::Gray)),
                        Some(4) => Some(ImageColorSpace::Direct(Components::Cmyk)),
                        _ => Some(ImageColorSpace::Direct(Components::Rgb)),
                    }
                }
                b"Indexed" | b"I" if arr.len() >= 4 => {
                    let ImageColorSpace::Direct(base) = image_color_space(doc, arr.get(1)?)? else {
                        return None;
                    };
                    let lookup = match resolve_object(doc, arr.get(3)?)? {
                        LoObject::String(bytes, _) => bytes.clone(),
                        LoObject::Stream(stream) => stream.get_plain_content().ok()?,
                        _ => return None,
                    };
                    Some(ImageColorSpace::Indexed { base, lookup })
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn decode_image_xobject(doc: &LoDocument, stream: &lopdf::Stream) -> Option<Pixmap> {
    let filters = stream.filters().unwrap_or_default();
    if filters.iter().any(|f| *f == b"DCTDecode") {
        let decoded =
            image::load_from_memory_with_format(&stream.content, image::ImageFormat::Jpeg).ok()?;
        return rgba_to_pixmap(&decoded.to_rgba8()).ok();
    }
    let plain = if filters.is_empty() {
        stream.content.clone()
    } else {
        stream.get_plain_content().ok()?
    };
    let rgba = raw_image_to_rgba(doc, &stream.dict, &plain)?;
    rgba_to_pixmap(&rgba).ok()
}

fn raw_image_to_rgba(doc: &LoDocument, dict: &LoDictionary, plain: &[u8]) -> Option<image::RgbaImage> {
    let dimension = |key: &[u8]| {
        dict.get(key)
            .ok()
            .and_then(|o| o.as_i64().ok())
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
    };
    let width = dimension(b"Width")?;
    let height = dimension(b"Height")?;
    let bpc = dict
        .get(b"BitsPerComponent")
        .ok()
        .and_then(|o| o.as_i64().ok())
        .unwrap_or(8);
    if bpc != 8 {
        return None;
    }
    let space = match dict.get(b"ColorSpace") {
        Ok(obj) => image_color_space(doc, obj)?,
        Err(_) => ImageColorSpace::Direct(Components::Gray),
    };
    let stride = match &space {
        ImageColorSpace::Direct(components) => components.channels(),
        ImageColorSpace::Indexed { .. } => 1,
    };
    let pixels = (width as usize).checked_mul(height as usize)?;
    if plain.len() < pixels.checked_mul(stride)? {
        return None;
    }

    let mut out = image::RgbaImage::new(width, height);
    for (px, src) in out.pixels_mut().zip(plain.chunks_exact(stride)) {
        let rgb = match &space {
            ImageColorSpace::Direct(components) => components.to_rgb(src)?,
            ImageColorSpace::Indexed { base, lookup } => {
                let channels = base.channels();
                let offset = src[0] as usize * channels;
                base.to_rgb(lookup.get(offset..offset + channels)?)?
            }
        };
        px.0 = [rgb[0], rgb[1], rgb[2], 255];
    }
    Some(out)
}

fn parse_matrix(obj: &LoObject) -> Option<Matrix> {
    let arr = obj.as_array().ok()?;
    if arr.len() < 6 {
        return None;
    }
    Some(Matrix::new(
        obj_to_f32(&arr[0])?,
        obj_to_f32(&arr[1])?,
        obj_to_f32(&arr[2])?,
        obj_to_f32(&arr[3])?,
        obj_to_f32(&arr[4])?,
        obj_to_f32(&arr[5])?,
    ))
}

fn resolve_object<'a>(doc: &'a LoDocument, mut obj: &'a LoObject) -> Option<&'a LoObject> {
    let mut hops = 0;
    while let LoObject::Reference(id) = obj {
        hops += 1;
        if hops > 32 {
            return None;
        }
        obj = doc.get_object(*id).ok()?;
    }
    Some(obj)
}

fn op_name(op: &Operation, idx: usize) -> Option<String> {
    let name = op.operands.get(idx)?.as_name().ok()?;
    Some(String::from_utf8_lossy(name).into_owned())
}

fn op_f32(op: &Operation, idx: usize) -> Option<f32> {
    obj_to_f32(op.operands.get(idx)?)
}

fn op_i64(op: &Operation, idx: usize) -> Option<i64> {
    op.operands.get(idx)?.as_i64().ok()
}

fn op_f32_2(op: &Operation) -> Option<[f32; 2]> {
    Some([op_f32(op, 0)?, op_f32(op, 1)?])
}

fn op_f32_4(op: &Operation) -> Option<[f32; 4]> {
    Some([op_f32(op, 0)?, op_f32(op, 1)?, op_f32(op, 2)?, op_f32(op, 3)?])
}

fn op_f32_6(op: &Operation) -> Option<[f32; 6]> {
    Some([
        op_f32(op, 0)?,
        op_f32(op, 1)?,
        op_f32(op, 2)?,
        op_f32(op, 3)?,
        op_f32(op, 4)?,
        op_f32(op, 5)?,
    ])
}

fn obj_to_f32(obj: &LoObject) -> Option<f32> {
    match obj {
        LoObject::Integer(v) => Some(*v as f32),
        LoObject::Real(v) => Some(*v),
        _ => None,
    }
}

fn cmyk_to_rgb(c: f32, m: f32, y: f32, k: f32) -> (f32, f32, f32) {
    let k = k.clamp(0.0, 1.0);
    (
        (1.0 - c.clamp(0.0, 1.0)) * (1.0 - k),
        (1.0 - m.clamp(0.0, 1.0)) * (1.0 - k),
        (1.0 - y.clamp(0.0, 1.0)) * (1.0 - k),
    )
}

fn decode_err(err: lopdf::Error) -> OverlayError {
    OverlayError::decode(format!("pdf: {err}"))
}
