use serde::{Deserialize, Serialize};

/// Width of the reference page that overlay font sizes are expressed against
/// (A4 portrait in points).
pub const REFERENCE_PAGE_WIDTH: f32 = 595.0;

/// Canonical page raster size in pixels. Every page of every document is
/// rasterized to this size regardless of the source aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageSize {
    pub width: u32,
    pub height: u32,
}

impl PageSize {
    /// A4 portrait at 150 DPI.
    pub const CANONICAL: PageSize = PageSize {
        width: 1240,
        height: 1754,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Same aspect ratio, scaled to `width` pixels wide.
    pub fn with_width(self, width: u32) -> Self {
        if self.width == 0 {
            return self;
        }
        let height = (self.height as f64 * width as f64 / self.width as f64).round() as u32;
        Self {
            width,
            height: height.max(1),
        }
    }

    /// Pixel scale applied to reference-point font sizes at this size.
    pub fn font_scale(self) -> f32 {
        self.width as f32 / REFERENCE_PAGE_WIDTH
    }

    /// Page size in PDF points when one pixel is one dot at 150 DPI.
    pub fn to_points(self) -> (f32, f32) {
        (self.width as f32 * 72.0 / 150.0, self.height as f32 * 72.0 / 150.0)
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self::CANONICAL
    }
}

/// A position expressed as percentages of the page dimensions (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentPoint {
    pub x: f32,
    pub y: f32,
}

impl PercentPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn to_pixels(self, size: PageSize) -> (f32, f32) {
        (
            self.x / 100.0 * size.width as f32,
            self.y / 100.0 * size.height as f32,
        )
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const WHITE: Rgb = Rgb {
        r: 255,
        g: 255,
        b: 255,
    };

    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };

    /// Parses `#rrggbb` or `#rgb` (leading `#` optional).
    pub fn from_hex(raw: &str) -> Option<Rgb> {
        let hex = raw.trim().trim_start_matches('#');
        let expanded: String = match hex.len() {
            3 => hex.chars().flat_map(|ch| [ch, ch]).collect(),
            6 => hex.to_string(),
            _ => return None,
        };
        let channel = |idx: usize| u8::from_str_radix(expanded.get(idx..idx + 2)?, 16).ok();
        Some(Rgb {
            r: channel(0)?,
            g: channel(2)?,
            b: channel(4)?,
        })
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub(crate) fn to_sk_color(self, alpha: f32) -> tiny_skia::Color {
        tiny_skia::Color::from_rgba8(
            self.r,
            self.g,
            self.b,
            (alpha.clamp(0.0, 1.0) * 255.0).round() as u8,
        )
    }
}
