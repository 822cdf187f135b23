use crate::error::{OverlayError, Result};
use crate::types::PageSize;
use lopdf::{Dictionary as LoDictionary, Document as LoDocument, Object as LoObject, ObjectId, Stream as LoStream, dictionary};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// Margin kept around imported vector pages, as a fraction of the page width.
const IMPORT_MARGIN: f32 = 0.02;

/// Builds one output PDF page by page. Every page has the canonical size.
pub struct PdfAssembler {
    doc: LoDocument,
    pages_id: ObjectId,
    kids: Vec<LoObject>,
    images: HashMap<[u8; 32], ObjectId>,
    width_pt: f32,
    height_pt: f32,
    title: Option<String>,
}

impl std::fmt::Debug for PdfAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdfAssembler")
            .field("pages", &self.kids.len())
            .field("images", &self.images.len())
            .finish()
    }
}

impl PdfAssembler {
    pub fn new(size: PageSize) -> Self {
        let mut doc = LoDocument::with_version("1.7");
        let pages_id = doc.new_object_id();
        let (width_pt, height_pt) = size.to_points();
        Self {
            doc,
            pages_id,
            kids: Vec::new(),
            images: HashMap::new(),
            width_pt,
            height_pt,
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        let title = title.into();
        self.title = (!title.trim().is_empty()).then_some(title);
        self
    }

    pub fn page_count(&self) -> usize {
        self.kids.len()
    }

    /// Runs `pages` as one unit: when it fails, every page it added is
    /// dropped again and the output is as it was before the call.
    pub fn stage_document<T>(&mut self, pages: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let mark = self.kids.len();
        let result = pages(self);
        if result.is_err() {
            self.kids.truncate(mark);
        }
        result
    }

    /// Adds a page showing `jpeg` stretched over the full page. Identical
    /// images are stored once.
    pub fn push_jpeg_page(&mut self, jpeg: &[u8], width_px: u32, height_px: u32) -> Result<()> {
        if width_px == 0 || height_px == 0 || jpeg.is_empty() {
            return Err(OverlayError::pdf("empty page image"));
        }
        let key: [u8; 32] = Sha256::digest(jpeg).into();
        let image_id = match self.images.get(&key) {
            Some(id) => *id,
            None => {
                let stream = LoStream::new(
                    dictionary! {
                        "Type" => "XObject",
                        "Subtype" => "Image",
                        "Width" => width_px as i64,
                        "Height" => height_px as i64,
                        "ColorSpace" => "DeviceRGB",
                        "BitsPerComponent" => 8,
                        "Filter" => "DCTDecode",
                    },
                    jpeg.to_vec(),
                )
                .with_compression(false);
                let id = self.doc.add_object(stream);
                self.images.insert(key, id);
                id
            }
        };
        let name = format!("Im{}", self.kids.len() + 1);
        let content = format!(
            "q {:.4} 0 0 {:.4} 0 0 cm /{} Do Q\n",
            self.width_pt, self.height_pt, name
        );
        self.push_page(content.into_bytes(), name, image_id);
        Ok(())
    }

    /// Imports every page of `bytes` unmodified, scaled to fit and centered.
    /// Nothing is added unless every page imports.
    pub fn push_pdf_pages(&mut self, bytes: &[u8]) -> Result<usize> {
        let src = LoDocument::load_mem(bytes)?;
        self.stage_document(|pdf| pdf.import_pages(src))
    }

    fn import_pages(&mut self, src: LoDocument) -> Result<usize> {
        let page_ids = import_document_objects(&mut self.doc, src)?;
        for page_id in &page_ids {
            let page = self
                .doc
                .get_object(*page_id)
                .and_then(LoObject::as_dict)?
                .clone();
            let content = self.doc.get_page_content(*page_id)?;
            let [x0, y0, x1, y1] = inherited_box(&self.doc, *page_id);
            let resources = page_resources_object(&self.doc, &page, *page_id);
            let form_id = self.doc.add_object(LoStream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Form",
                    "FormType" => 1,
                    "BBox" => vec![x0.into(), y0.into(), x1.into(), y1.into()],
                    "Resources" => resources,
                },
                content,
            ));

            let (bw, bh) = ((x1 - x0).max(1.0), (y1 - y0).max(1.0));
            let margin = self.width_pt * IMPORT_MARGIN;
            let scale = ((self.width_pt - 2.0 * margin) / bw).min((self.height_pt - 2.0 * margin) / bh);
            let tx = (self.width_pt - bw * scale) / 2.0 - x0 * scale;
            let ty = (self.height_pt - bh * scale) / 2.0 - y0 * scale;
            let name = format!("Src{}", self.kids.len() + 1);
            let content = format!(
                "q {scale:.6} 0 0 {scale:.6} {tx:.4} {ty:.4} cm /{name} Do Q\n"
            );
            self.push_page(content.into_bytes(), name, form_id);
        }
        Ok(page_ids.len())
    }

    fn push_page(&mut self, content: Vec<u8>, xobject_name: String, xobject_id: ObjectId) {
        let content_id = self.doc.add_object(LoStream::new(dictionary! {}, content));
        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! {
                    xobject_name => xobject_id,
                },
            },
            "MediaBox" => vec![0.into(), 0.into(), self.width_pt.into(), self.height_pt.into()],
        });
        self.kids.push(LoObject::Reference(page_id));
    }

    pub fn finish(mut self) -> Result<Vec<u8>> {
        if self.kids.is_empty() {
            return Err(OverlayError::pdf("no pages to write"));
        }
        let count = self.kids.len() as i64;
        self.doc.objects.insert(
            self.pages_id,
            LoObject::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => std::mem::take(&mut self.kids),
                "Count" => count,
            }),
        );
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);
        if let Some(title) = self.title.take() {
            let info_id = self.doc.add_object(dictionary! {
                "Title" => LoObject::string_literal(title),
                "Producer" => LoObject::string_literal("setlist-overlay"),
            });
            self.doc.trailer.set("Info", info_id);
        }
        self.doc.prune_objects();
        self.doc.renumber_objects();
        self.doc.compress();
        let mut out = Vec::new();
        self.doc.save_to(&mut out)?;
        Ok(out)
    }
}

fn import_document_objects(dst: &mut LoDocument, mut src: LoDocument) -> Result<Vec<ObjectId>> {
    if src.is_encrypted() {
        return Err(OverlayError::pdf("source PDF is encrypted"));
    }
    let start_id = dst.max_id + 1;
    src.renumber_objects_with(start_id);
    let page_ids: Vec<ObjectId> = src.get_pages().values().copied().collect();
    if page_ids.is_empty() {
        return Err(OverlayError::pdf("source PDF has no pages"));
    }
    dst.max_id = dst.max_id.max(src.max_id);
    dst.objects.extend(src.objects);
    Ok(page_ids)
}

/// CropBox, else MediaBox, following the page tree; Letter when neither is set.
fn inherited_box(doc: &LoDocument, page_id: ObjectId) -> [f32; 4] {
    let mut id = page_id;
    let mut seen = HashSet::new();
    while seen.insert(id) {
        let Ok(dict) = doc.get_object(id).and_then(LoObject::as_dict) else {
            break;
        };
        for key in [b"CropBox".as_slice(), b"MediaBox".as_slice()] {
            if let Some(rect) = dict
                .get(key)
                .ok()
                .and_then(|obj| resolve(doc, obj).as_array().ok())
                .and_then(|arr| parse_rect(arr))
            {
                return rect;
            }
        }
        match dict.get(b"Parent").and_then(LoObject::as_reference) {
            Ok(parent) => id = parent,
            Err(_) => break,
        }
    }
    [0.0, 0.0, 612.0, 792.0]
}

fn parse_rect(arr: &[LoObject]) -> Option<[f32; 4]> {
    let values: Vec<f32> = arr.iter().take(4).filter_map(number).collect();
    let [a, b, c, d] = values.as_slice() else {
        return None;
    };
    Some([a.min(*c), b.min(*d), a.max(*c), b.max(*d)])
}

fn number(obj: &LoObject) -> Option<f32> {
    match obj {
        LoObject::Integer(v) => Some(*v as f32),
        LoObject::Real(v) => Some(*v),
        _ => None,
    }
}

fn resolve<'a>(doc: &'a LoDocument, obj: &'a LoObject) -> &'a LoObject {
    match obj {
        LoObject::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

/// The page's own resources, else the nearest inherited ones.
fn page_resources_object(doc: &LoDocument, page: &LoDictionary, page_id: ObjectId) -> LoObject {
    if let Ok(obj) = page.get(b"Resources") {
        return resolve(doc, obj).clone();
    }
    let mut seen = HashSet::from([page_id]);
    let mut parent = page.get(b"Parent").and_then(LoObject::as_reference).ok();
    while let Some(id) = parent.filter(|id| seen.insert(*id)) {
        let Ok(dict) = doc.get_object(id).and_then(LoObject::as_dict) else {
            break;
        };
        if let Ok(obj) = dict.get(b"Resources") {
            return resolve(doc, obj).clone();
        }
        parent = dict.get(b"Parent").and_then(LoObject::as_reference).ok();
    }
    LoObject::Dictionary(LoDictionary::new())
}
