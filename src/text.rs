use crate::font::RegisteredFont;
use rustybuzz::{Direction as HbDirection, Face as HbFace, UnicodeBuffer};
use tiny_skia::{Path, PathBuilder};
use ttf_parser::{GlyphId, OutlineBuilder};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct GlyphPlacement {
    pub glyph_id: u16,
    pub x: f32,
    pub y: f32,
}

/// One shaped line of text in pixel units, pen starting at x = 0 on the baseline.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TextLayout {
    pub glyphs: Vec<GlyphPlacement>,
    pub advance: f32,
    pub ascent: f32,
    pub descent: f32,
    pub scale: f32,
}

impl TextLayout {
    pub fn height(&self) -> f32 {
        self.ascent + self.descent
    }
}

pub(crate) fn layout_line(font: &RegisteredFont, text: &str, font_px: f32) -> Option<TextLayout> {
    if text.trim().is_empty() || !font_px.is_finite() || font_px <= 0.0 {
        return None;
    }
    let upem = font.units_per_em.max(1) as f32;
    let scale = font_px / upem;
    let (glyphs, advance) = shape_glyphs(&font.data, text, font_px, upem)
        .or_else(|| unshaped_glyphs(&font.data, text, font_px, upem))?;
    if glyphs.is_empty() {
        return None;
    }
    Some(TextLayout {
        glyphs,
        advance,
        ascent: font.ascender.max(0) as f32 * scale,
        descent: (-(font.descender.min(0) as f32)) * scale,
        scale,
    })
}

fn shape_glyphs(
    font_data: &[u8],
    text: &str,
    font_px: f32,
    upem: f32,
) -> Option<(Vec<GlyphPlacement>, f32)> {
    let face = HbFace::from_slice(font_data, 0)?;
    let mut buffer = UnicodeBuffer::new();
    buffer.set_direction(detect_direction(text));
    buffer.push_str(text);
    let output = rustybuzz::shape(&face, &[], buffer);
    let infos = output.glyph_infos();
    let positions = output.glyph_positions();
    if infos.is_empty() || infos.len() != positions.len() {
        return None;
    }

    let mut out = Vec::with_capacity(infos.len());
    let mut pen_x = 0.0f32;
    for (info, pos) in infos.iter().zip(positions.iter()) {
        let gid = info.glyph_id as u16;
        let x_off = pos.x_offset as f32 / upem * font_px;
        let y_off = pos.y_offset as f32 / upem * font_px;
        if gid != 0 {
            out.push(GlyphPlacement {
                glyph_id: gid,
                x: pen_x + x_off,
                y: y_off,
            });
        }
        pen_x += pos.x_advance as f32 / upem * font_px;
    }
    Some((out, pen_x))
}

fn unshaped_glyphs(
    font_data: &[u8],
    text: &str,
    font_px: f32,
    upem: f32,
) -> Option<(Vec<GlyphPlacement>, f32)> {
    let face = ttf_parser::Face::parse(font_data, 0).ok()?;
    let mut out = Vec::new();
    let mut pen_x = 0.0f32;
    for ch in text.chars() {
        let gid = face.glyph_index(ch).map(|id| id.0).unwrap_or(0);
        if gid == 0 {
            pen_x += font_px * 0.5;
            continue;
        }
        out.push(GlyphPlacement {
            glyph_id: gid,
            x: pen_x,
            y: 0.0,
        });
        let advance_units = face.glyph_hor_advance(GlyphId(gid)).unwrap_or(0) as f32;
        let mut adv = advance_units / upem * font_px;
        if adv <= 0.0 {
            adv = font_px * 0.5;
        }
        pen_x += adv;
    }
    Some((out, pen_x))
}

fn detect_direction(text: &str) -> HbDirection {
    for ch in text.chars() {
        let code = ch as u32;
        let rtl = matches!(
            code,
            0x0590..=0x08FF | 0xFB1D..=0xFDFF | 0xFE70..=0xFEFF | 0x1EE00..=0x1EEFF
        );
        if rtl {
            return HbDirection::RightToLeft;
        }
    }
    HbDirection::LeftToRight
}

/// All glyph outlines of `layout` as one device-space path, with the pen origin
/// at (`origin_x`, `baseline_y`) in a y-down raster.
pub(crate) fn layout_path(
    font: &RegisteredFont,
    layout: &TextLayout,
    origin_x: f32,
    baseline_y: f32,
) -> Option<Path> {
    let face = ttf_parser::Face::parse(&font.data, 0).ok()?;
    let mut builder = GlyphPathBuilder {
        builder: PathBuilder::new(),
        origin_x: 0.0,
        origin_y: 0.0,
        scale: layout.scale,
    };
    for glyph in &layout.glyphs {
        builder.origin_x = origin_x + glyph.x;
        builder.origin_y = baseline_y - glyph.y;
        let _ = face.outline_glyph(GlyphId(glyph.glyph_id), &mut builder);
    }
    builder.builder.finish()
}

struct GlyphPathBuilder {
    builder: PathBuilder,
    origin_x: f32,
    origin_y: f32,
    scale: f32,
}

impl GlyphPathBuilder {
    fn map(&self, x: f32, y: f32) -> (f32, f32) {
        (self.origin_x + x * self.scale, self.origin_y - y * self.scale)
    }
}

impl OutlineBuilder for GlyphPathBuilder {
    fn move_to(&mut self, x: f32, y: f32) {
        let (x, y) = self.map(x, y);
        self.builder.move_to(x, y);
    }

    fn line_to(&mut self, x: f32, y: f32) {
        let (x, y) = self.map(x, y);
        self.builder.line_to(x, y);
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        let (x1, y1) = self.map(x1, y1);
        let (x, y) = self.map(x, y);
        self.builder.quad_to(x1, y1, x, y);
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        let (x1, y1) = self.map(x1, y1);
        let (x2, y2) = self.map(x2, y2);
        let (x, y) = self.map(x, y);
        self.builder.cubic_to(x1, y1, x2, y2, x, y);
    }

    fn close(&mut self) {
        self.builder.close();
    }
}
