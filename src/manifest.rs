use crate::document::{BatchMetadata, Document, DocumentId};
use crate::error::Result;
use crate::model::StyleEdit;
use crate::session::Session;
use crate::types::PercentPoint;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A whole batch as JSON: metadata, documents, and optional pre-authored overlays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchManifest {
    #[serde(default)]
    pub metadata: BatchMetadata,
    pub documents: Vec<ManifestDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    #[serde(flatten)]
    pub document: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub song_form: Option<ManifestStyle>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub part_tags: Vec<ManifestTag>,
}

/// Overrides on top of the default song-form style.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestStyle {
    #[serde(default)]
    pub x: Option<f32>,
    #[serde(default)]
    pub y: Option<f32>,
    #[serde(default)]
    pub font_size: Option<f32>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub opacity: Option<f32>,
}

impl ManifestStyle {
    fn edits(&self) -> Vec<StyleEdit> {
        let mut edits = Vec::new();
        if let Some(size) = self.font_size {
            edits.push(StyleEdit::FontSize(size));
        }
        if let Some(color) = &self.color {
            edits.push(StyleEdit::Color(color.clone()));
        }
        if let Some(opacity) = self.opacity {
            edits.push(StyleEdit::Opacity(opacity));
        }
        edits
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestTag {
    pub label: String,
    pub x: f32,
    pub y: f32,
    /// Zero-based page the tag is pinned to.
    #[serde(default)]
    pub page: usize,
    #[serde(flatten)]
    pub style: ManifestStyle,
}

impl BatchManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a manifest; relative source paths resolve against its directory.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let body = tokio::fs::read_to_string(path).await?;
        let mut manifest = Self::from_json(&body)?;
        if let Some(base) = path.parent() {
            manifest.resolve_sources(base);
        }
        Ok(manifest)
    }

    pub fn resolve_sources(&mut self, base: &Path) {
        for entry in &mut self.documents {
            let Some(url) = entry.document.source_url.as_mut() else {
                continue;
            };
            if url.contains("://") || url.starts_with("data:") || Path::new(url.as_str()).is_absolute() {
                continue;
            }
            *url = base.join(url.as_str()).display().to_string();
        }
    }

    pub fn documents(&self) -> Vec<Document> {
        self.documents.iter().map(|entry| entry.document.clone()).collect()
    }

    pub fn entry(&self, id: &DocumentId) -> Option<&ManifestDocument> {
        self.documents.iter().find(|entry| &entry.document.id == id)
    }

    /// Applies this manifest's overlays to the session's current document.
    /// Tags pinned past the last loaded page are skipped. Returns the number
    /// of tags added.
    pub fn apply_to(&self, session: &mut Session) -> Result<usize> {
        let id = session.current_document().id.clone();
        let Some(entry) = self.entry(&id) else {
            return Ok(0);
        };
        if let Some(style) = &entry.song_form {
            let current = session
                .song_form_style(&id)
                .map(|s| s.position())
                .unwrap_or_else(|| PercentPoint::new(50.0, 4.0));
            if style.x.is_some() || style.y.is_some() {
                session.move_song_form(PercentPoint::new(
                    style.x.unwrap_or(current.x),
                    style.y.unwrap_or(current.y),
                ));
            }
            for edit in style.edits() {
                session.edit_song_form(&edit)?;
            }
        }

        let pages = session.page_count().unwrap_or(1);
        let shown = session.current_page_index();
        let mut added = 0;
        for tag in &entry.part_tags {
            if tag.page >= pages {
                tracing::warn!(document = %id, label = %tag.label, page = tag.page, pages, "tag page out of range; skipped");
                continue;
            }
            session.set_page(tag.page);
            let tag_id = session.add_part_tag(&tag.label, PercentPoint::new(tag.x, tag.y))?;
            for edit in tag.style.edits() {
                session.edit_part_tag(tag_id, &edit)?;
            }
            added += 1;
        }
        session.set_page(shown);
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Page;
    use crate::session::SessionStart;

    const MANIFEST: &str = r##"{
        "metadata": { "title": "Sunday", "date": "2026-10-18" },
        "documents": [
            {
                "id": "a",
                "display_name": "Amazing Grace",
                "source_url": "sheets/amazing.pdf",
                "song_form_labels": ["V1", "C"],
                "song_form": { "x": 80, "font_size": 24, "color": "#ff0000" },
                "part_tags": [
                    { "label": "C", "x": 50, "y": 50 },
                    { "label": "B", "x": 20, "y": 70, "page": 1, "opacity": 0.5 },
                    { "label": "O", "x": 20, "y": 70, "page": 9 }
                ]
            },
            { "id": "b", "display_name": "Blessed Be", "source_url": "https://example.com/b.png" }
        ]
    }"##;

    #[test]
    fn parses_documents_and_resolves_relative_sources() {
        let mut manifest = BatchManifest::from_json(MANIFEST).unwrap();
        manifest.resolve_sources(Path::new("/batches"));
        let documents = manifest.documents();
        assert_eq!(documents.len(), 2);
        assert_eq!(
            documents[0].source_url.as_deref(),
            Some(Path::new("/batches").join("sheets/amazing.pdf").display().to_string().as_str())
        );
        assert_eq!(documents[1].source_url.as_deref(), Some("https://example.com/b.png"));
        assert_eq!(documents[0].song_form_labels, vec!["V1", "C"]);
        assert_eq!(manifest.metadata.title, "Sunday");
        assert!(BatchManifest::from_json("{\"documents\": 3}").is_err());
    }

    #[test]
    fn overlays_apply_to_the_current_document() {
        let manifest = BatchManifest::from_json(MANIFEST).unwrap();
        let SessionStart::Active(mut session) = Session::start(manifest.documents()) else {
            panic!("document a is labelled");
        };
        let ticket = session.begin_page_load();
        let pages = (0..2)
            .map(|index| Page::new(index, tiny_skia::Pixmap::new(10, 14).unwrap()))
            .collect();
        session.finish_page_load(ticket, Ok(pages));

        assert_eq!(manifest.apply_to(&mut session).unwrap(), 2);
        let id = DocumentId::from("a");
        let style = session.song_form_style(&id).unwrap();
        assert_eq!((style.x, style.y), (80.0, 4.0));
        assert_eq!(style.font_size, 24.0);
        assert_eq!(style.color, "#ff0000");
        let tags = session.part_tags(&id);
        assert_eq!(tags[1].page_index, 1);
        assert_eq!(tags[1].opacity, 0.5);
        assert_eq!(session.current_page_index(), 0);
    }
}
