use crate::error::{OverlayError, Result};
use crate::export::ExportArtifact;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Platform file-save primitive. Returns where the file ended up.
#[async_trait]
pub trait SaveFile: Send + Sync {
    async fn save(&self, artifact: &ExportArtifact) -> Result<String>;
}

/// Optional native share primitive.
#[async_trait]
pub trait ShareFile: Send + Sync {
    async fn share(&self, artifact: &ExportArtifact) -> Result<()>;
}

/// Saves into one directory, keeping file names and numbering collisions.
#[derive(Debug, Clone)]
pub struct DirectorySaver {
    dir: PathBuf,
}

impl DirectorySaver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn free_path(&self, file_name: &str) -> Result<PathBuf> {
        let candidate = self.dir.join(file_name);
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        let (stem, ext) = match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (file_name, None),
        };
        for n in 1..10_000 {
            let name = match ext {
                Some(ext) => format!("{stem} ({n}).{ext}"),
                None => format!("{stem} ({n})"),
            };
            let candidate = self.dir.join(name);
            if !tokio::fs::try_exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(OverlayError::delivery(format!("no free name for {file_name}")))
    }
}

#[async_trait]
impl SaveFile for DirectorySaver {
    async fn save(&self, artifact: &ExportArtifact) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.free_path(&safe_file_name(&artifact.file_name)).await?;
        tokio::fs::write(&path, &artifact.bytes).await?;
        tracing::debug!(path = %path.display(), bytes = artifact.bytes.len(), "file saved");
        Ok(path.display().to_string())
    }
}

/// Replaces path separators and control characters.
fn safe_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '-',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Every file can be saved directly.
    Unrestricted,
    /// Handsets: files are collected for review instead.
    Restricted,
}

impl Platform {
    pub fn from_user_agent(user_agent: &str) -> Self {
        const HANDSET_MARKERS: [&str; 5] = ["iPhone", "iPad", "iPod", "Android", "Mobile"];
        if HANDSET_MARKERS.iter().any(|marker| user_agent.contains(marker)) {
            Platform::Restricted
        } else {
            Platform::Unrestricted
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Delivering,
    Done,
    Collecting,
    ReadyForReview,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Saved(String),
    Shared,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct DeliveryItem {
    pub artifact: ExportArtifact,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub delivered: usize,
    pub failed: usize,
}

pub struct DeliveryAdapter {
    platform: Platform,
    saver: Arc<dyn SaveFile>,
    sharer: Option<Arc<dyn ShareFile>>,
    state: DeliveryState,
    items: Vec<DeliveryItem>,
}

impl std::fmt::Debug for DeliveryAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryAdapter")
            .field("platform", &self.platform)
            .field("state", &self.state)
            .field("items", &self.items.len())
            .field("can_share", &self.sharer.is_some())
            .finish()
    }
}

impl DeliveryAdapter {
    pub fn new(platform: Platform, saver: Arc<dyn SaveFile>) -> Self {
        Self {
            platform,
            saver,
            sharer: None,
            state: DeliveryState::Idle,
            items: Vec::new(),
        }
    }

    pub fn with_sharer(mut self, sharer: Arc<dyn ShareFile>) -> Self {
        self.sharer = Some(sharer);
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Unrestricted platforms save everything now. Restricted platforms
    /// collect the files for [`review_items`](Self::review_items).
    pub async fn deliver(&mut self, artifacts: Vec<ExportArtifact>) -> DeliverySummary {
        self.items = artifacts
            .into_iter()
            .map(|artifact| DeliveryItem {
                artifact,
                status: ItemStatus::Pending,
            })
            .collect();
        match self.platform {
            Platform::Unrestricted => {
                self.state = DeliveryState::Delivering;
                let summary = self.save_all().await;
                self.state = DeliveryState::Done;
                summary
            }
            Platform::Restricted => {
                self.state = DeliveryState::Collecting;
                tracing::info!(files = self.items.len(), "files ready for review");
                self.state = DeliveryState::ReadyForReview;
                DeliverySummary::default()
            }
        }
    }

    pub fn review_items(&self) -> &[DeliveryItem] {
        &self.items
    }

    pub async fn save_item(&mut self, index: usize) -> Result<()> {
        let artifact = self.item(index)?.artifact.clone();
        let status = match self.saver.save(&artifact).await {
            Ok(location) => ItemStatus::Saved(location),
            Err(err) => {
                tracing::warn!(file = %artifact.file_name, error = %err, "save failed");
                self.items[index].status = ItemStatus::Failed(err.to_string());
                return Err(err);
            }
        };
        self.items[index].status = status;
        Ok(())
    }

    /// Hands the file to the share primitive, or saves it when there is none.
    pub async fn share_item(&mut self, index: usize) -> Result<()> {
        let Some(sharer) = self.sharer.clone() else {
            return self.save_item(index).await;
        };
        let artifact = self.item(index)?.artifact.clone();
        match sharer.share(&artifact).await {
            Ok(()) => {
                self.items[index].status = ItemStatus::Shared;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(file = %artifact.file_name, error = %err, "share failed");
                self.items[index].status = ItemStatus::Failed(err.to_string());
                Err(err)
            }
        }
    }

    /// Saves every item that is not yet delivered. A failure does not stop
    /// later items.
    pub async fn save_all(&mut self) -> DeliverySummary {
        let mut summary = DeliverySummary::default();
        for index in 0..self.items.len() {
            if matches!(self.items[index].status, ItemStatus::Saved(_) | ItemStatus::Shared) {
                summary.delivered += 1;
                continue;
            }
            match self.save_item(index).await {
                Ok(()) => summary.delivered += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }

    fn item(&self, index: usize) -> Result<&DeliveryItem> {
        self.items
            .get(index)
            .ok_or_else(|| OverlayError::delivery(format!("no file at position {index}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::JPEG_MIME;
    use std::sync::Mutex;

    fn artifact(name: &str) -> ExportArtifact {
        ExportArtifact {
            file_name: name.to_string(),
            bytes: name.as_bytes().to_vec(),
            mime: JPEG_MIME,
        }
    }

    /// Rejects files whose name contains "bad".
    #[derive(Default)]
    struct PickySaver {
        saved: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SaveFile for PickySaver {
        async fn save(&self, artifact: &ExportArtifact) -> Result<String> {
            if artifact.file_name.contains("bad") {
                return Err(OverlayError::delivery("rejected"));
            }
            self.saved.lock().unwrap().push(artifact.file_name.clone());
            Ok(artifact.file_name.clone())
        }
    }

    #[derive(Default)]
    struct RecordingSharer {
        shared: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ShareFile for RecordingSharer {
        async fn share(&self, artifact: &ExportArtifact) -> Result<()> {
            self.shared.lock().unwrap().push(artifact.file_name.clone());
            Ok(())
        }
    }

    #[test]
    fn handset_agents_are_restricted() {
        let iphone = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile/15E148";
        assert_eq!(Platform::from_user_agent(iphone), Platform::Restricted);
        assert_eq!(
            Platform::from_user_agent("Mozilla/5.0 (Linux; Android 14; Pixel 8)"),
            Platform::Restricted
        );
        assert_eq!(
            Platform::from_user_agent("Mozilla/5.0 (X11; Linux x86_64) Firefox/131.0"),
            Platform::Unrestricted
        );
    }

    #[tokio::test]
    async fn directory_saver_numbers_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let saver = DirectorySaver::new(dir.path().join("out"));
        let first = saver.save(&artifact("01_Song.jpg")).await.unwrap();
        let second = saver.save(&artifact("01_Song.jpg")).await.unwrap();
        let third = saver.save(&artifact("a/b.jpg")).await.unwrap();
        assert!(first.ends_with("01_Song.jpg"));
        assert!(second.ends_with("01_Song (1).jpg"));
        assert!(third.ends_with("a-b.jpg"));
        assert_eq!(std::fs::read(&second).unwrap(), b"01_Song.jpg");
    }

    #[tokio::test]
    async fn unrestricted_delivery_saves_everything_and_continues_past_failures() {
        let saver = Arc::new(PickySaver::default());
        let mut adapter = DeliveryAdapter::new(Platform::Unrestricted, saver.clone());
        assert_eq!(adapter.state(), DeliveryState::Idle);
        let summary = adapter
            .deliver(vec![artifact("one.jpg"), artifact("bad.jpg"), artifact("three.jpg")])
            .await;
        assert_eq!(summary, DeliverySummary { delivered: 2, failed: 1 });
        assert_eq!(adapter.state(), DeliveryState::Done);
        assert_eq!(*saver.saved.lock().unwrap(), vec!["one.jpg", "three.jpg"]);
        assert!(matches!(adapter.review_items()[1].status, ItemStatus::Failed(_)));
    }

    #[tokio::test]
    async fn restricted_delivery_waits_for_review() {
        let saver = Arc::new(PickySaver::default());
        let mut adapter = DeliveryAdapter::new(Platform::Restricted, saver.clone());
        let summary = adapter
            .deliver(vec![artifact("one.jpg"), artifact("two.jpg")])
            .await;
        assert_eq!(summary, DeliverySummary::default());
        assert_eq!(adapter.state(), DeliveryState::ReadyForReview);
        assert!(saver.saved.lock().unwrap().is_empty());

        // No share primitive: sharing saves.
        adapter.share_item(1).await.unwrap();
        assert_eq!(adapter.review_items()[1].status, ItemStatus::Saved("two.jpg".into()));
        assert_eq!(adapter.save_all().await, DeliverySummary { delivered: 2, failed: 0 });
        assert_eq!(saver.saved.lock().unwrap().len(), 2);
        assert!(adapter.save_item(5).await.is_err());
    }

    #[tokio::test]
    async fn share_uses_native_primitive_when_present() {
        let sharer = Arc::new(RecordingSharer::default());
        let mut adapter = DeliveryAdapter::new(Platform::Restricted, Arc::new(PickySaver::default()))
            .with_sharer(sharer.clone());
        adapter.deliver(vec![artifact("setlist.pdf")]).await;
        adapter.share_item(0).await.unwrap();
        assert_eq!(adapter.review_items()[0].status, ItemStatus::Shared);
        assert_eq!(*sharer.shared.lock().unwrap(), vec!["setlist.pdf"]);
    }
}
