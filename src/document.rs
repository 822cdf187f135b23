use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Pdf,
    Image,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Pdf => "pdf",
            SourceKind::Image => "image",
        }
    }
}

/// One song's sheet music plus the song-form labels chosen for it upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub display_name: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub source_kind: Option<SourceKind>,
    #[serde(default)]
    pub song_form_labels: Vec<String>,
}

impl Document {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: DocumentId::new(id),
            display_name: display_name.into(),
            source_url: None,
            source_kind: None,
            song_form_labels: Vec::new(),
        }
    }

    pub fn with_source(mut self, url: impl Into<String>, kind: Option<SourceKind>) -> Self {
        self.source_url = Some(url.into());
        self.source_kind = kind;
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.song_form_labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_song_form(&self) -> bool {
        self.song_form_labels
            .iter()
            .any(|label| !label.trim().is_empty())
    }

    /// Labels joined the way they are drawn on the page: `V1 - C - B`.
    pub fn song_form_text(&self) -> String {
        self.song_form_labels
            .iter()
            .map(|label| label.trim())
            .filter(|label| !label.is_empty())
            .collect::<Vec<_>>()
            .join(" - ")
    }

    /// Source kind with the URL used as a hint when the kind was not supplied.
    pub fn effective_source_kind(&self) -> Option<SourceKind> {
        if let Some(kind) = self.source_kind {
            return Some(kind);
        }
        let url = self.source_url.as_deref()?;
        let path = url.split(['?', '#']).next().unwrap_or(url);
        if path.to_ascii_lowercase().ends_with(".pdf") || url.starts_with("data:application/pdf")
        {
            Some(SourceKind::Pdf)
        } else {
            Some(SourceKind::Image)
        }
    }

    /// File extension of the raw source, used when the source is delivered unmodified.
    pub fn source_extension(&self) -> &'static str {
        match self.effective_source_kind() {
            Some(SourceKind::Pdf) => "pdf",
            _ => {
                let url = self.source_url.as_deref().unwrap_or_default().to_ascii_lowercase();
                let path = url.split(['?', '#']).next().unwrap_or_default();
                if path.ends_with(".png") || url.starts_with("data:image/png") {
                    "png"
                } else if path.ends_with(".webp") {
                    "webp"
                } else {
                    "jpg"
                }
            }
        }
    }
}

/// Batch-level metadata supplied alongside the document list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub date: String,
    /// Output name used only when the batch contains exactly one document.
    #[serde(default)]
    pub custom_file_name: Option<String>,
}
