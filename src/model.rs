use crate::error::{OverlayError, Result};
use crate::types::{PercentPoint, Rgb};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Positions never sit flush against a page edge so labels cannot clip off-page.
pub const MIN_X: f32 = 5.0;
pub const MAX_X: f32 = 95.0;
pub const MIN_Y: f32 = 3.0;
pub const MAX_Y: f32 = 97.0;

pub const MIN_FONT_SIZE: f32 = 8.0;
pub const MAX_FONT_SIZE: f32 = 72.0;

pub const DEFAULT_TAG_FONT_SIZE: f32 = 18.0;
pub const CUSTOM_TAG_COLOR: &str = "#374151";

pub fn clamp_position(point: PercentPoint) -> PercentPoint {
    let x = if point.x.is_finite() { point.x } else { 50.0 };
    let y = if point.y.is_finite() { point.y } else { 50.0 };
    PercentPoint {
        x: x.clamp(MIN_X, MAX_X),
        y: y.clamp(MIN_Y, MAX_Y),
    }
}

/// The song-form label style of one document. Drawn identically on every page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongFormStyle {
    pub x: f32,
    pub y: f32,
    pub font_size: f32,
    pub color: String,
    pub opacity: f32,
}

impl Default for SongFormStyle {
    fn default() -> Self {
        Self {
            x: 50.0,
            y: 4.0,
            font_size: 20.0,
            color: "#000000".to_string(),
            opacity: 1.0,
        }
    }
}

impl SongFormStyle {
    pub fn position(&self) -> PercentPoint {
        PercentPoint::new(self.x, self.y)
    }

    pub fn set_position(&mut self, point: PercentPoint) {
        let point = clamp_position(point);
        self.x = point.x;
        self.y = point.y;
    }

    pub fn apply(&mut self, edit: &StyleEdit) -> Result<()> {
        apply_edit(edit, &mut self.font_size, &mut self.color, &mut self.opacity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagId(pub u64);

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag-{}", self.0)
    }
}

/// A page-scoped text overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartTag {
    pub id: TagId,
    pub label: String,
    pub x: f32,
    pub y: f32,
    pub font_size: f32,
    pub color: String,
    pub opacity: f32,
    pub page_index: usize,
}

impl PartTag {
    /// New tag at `point` (clamped) with the label's palette color.
    pub fn new(id: TagId, label: impl Into<String>, point: PercentPoint, page_index: usize) -> Self {
        let label = label.into();
        let color = PartLabel::default_color_for(&label).to_string();
        let point = clamp_position(point);
        Self {
            id,
            label,
            x: point.x,
            y: point.y,
            font_size: DEFAULT_TAG_FONT_SIZE,
            color,
            opacity: 1.0,
            page_index,
        }
    }

    pub fn position(&self) -> PercentPoint {
        PercentPoint::new(self.x, self.y)
    }

    pub fn set_position(&mut self, point: PercentPoint) {
        let point = clamp_position(point);
        self.x = point.x;
        self.y = point.y;
    }

    pub fn apply(&mut self, edit: &StyleEdit) -> Result<()> {
        apply_edit(edit, &mut self.font_size, &mut self.color, &mut self.opacity)
    }
}

/// Knob adjustments shared by the song-form label and part tags.
#[derive(Debug, Clone, PartialEq)]
pub enum StyleEdit {
    FontSize(f32),
    Color(String),
    Opacity(f32),
}

fn apply_edit(
    edit: &StyleEdit,
    font_size: &mut f32,
    color: &mut String,
    opacity: &mut f32,
) -> Result<()> {
    match edit {
        StyleEdit::FontSize(size) => {
            if !size.is_finite() {
                return Err(OverlayError::invalid_configuration(format!(
                    "font size must be finite, got {size}"
                )));
            }
            *font_size = size.clamp(MIN_FONT_SIZE, MAX_FONT_SIZE);
        }
        StyleEdit::Color(raw) => {
            let parsed = Rgb::from_hex(raw).ok_or_else(|| {
                OverlayError::invalid_configuration(format!("not a hex color: {raw:?}"))
            })?;
            *color = parsed.to_hex();
        }
        StyleEdit::Opacity(value) => {
            if !value.is_finite() {
                return Err(OverlayError::invalid_configuration(format!(
                    "opacity must be finite, got {value}"
                )));
            }
            *opacity = value.clamp(0.0, 1.0);
        }
    }
    Ok(())
}

/// The closed palette of part-tag tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartLabel {
    Intro,
    Verse,
    Verse1,
    Verse2,
    Verse3,
    PreChorus,
    Chorus,
    Chorus1,
    Chorus2,
    Bridge,
    Interlude,
    Outro,
    Ending,
}

impl PartLabel {
    pub const ALL: [PartLabel; 13] = [
        PartLabel::Intro,
        PartLabel::Verse,
        PartLabel::Verse1,
        PartLabel::Verse2,
        PartLabel::Verse3,
        PartLabel::PreChorus,
        PartLabel::Chorus,
        PartLabel::Chorus1,
        PartLabel::Chorus2,
        PartLabel::Bridge,
        PartLabel::Interlude,
        PartLabel::Outro,
        PartLabel::Ending,
    ];

    pub fn token(self) -> &'static str {
        match self {
            PartLabel::Intro => "I",
            PartLabel::Verse => "V",
            PartLabel::Verse1 => "V1",
            PartLabel::Verse2 => "V2",
            PartLabel::Verse3 => "V3",
            PartLabel::PreChorus => "PC",
            PartLabel::Chorus => "C",
            PartLabel::Chorus1 => "C1",
            PartLabel::Chorus2 => "C2",
            PartLabel::Bridge => "B",
            PartLabel::Interlude => "Int",
            PartLabel::Outro => "O",
            PartLabel::Ending => "E",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            PartLabel::Intro => "#6b7280",
            PartLabel::Verse | PartLabel::Verse1 | PartLabel::Verse2 | PartLabel::Verse3 => {
                "#2563eb"
            }
            PartLabel::PreChorus => "#7c3aed",
            PartLabel::Chorus | PartLabel::Chorus1 | PartLabel::Chorus2 => "#dc2626",
            PartLabel::Bridge => "#059669",
            PartLabel::Interlude => "#d97706",
            PartLabel::Outro | PartLabel::Ending => "#4b5563",
        }
    }

    pub fn from_token(token: &str) -> Option<PartLabel> {
        let token = token.trim();
        PartLabel::ALL
            .into_iter()
            .find(|label| label.token().eq_ignore_ascii_case(token))
    }

    /// Palette color for a known token, neutral gray for custom strings.
    pub fn default_color_for(label: &str) -> &'static str {
        PartLabel::from_token(label)
            .map(PartLabel::color)
            .unwrap_or(CUSTOM_TAG_COLOR)
    }
}
