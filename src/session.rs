use crate::composite::{CompositedPage, Compositor, Scene};
use crate::document::{Document, DocumentId};
use crate::error::{OverlayError, Result};
use crate::interaction::OverlayTarget;
use crate::model::{PartTag, SongFormStyle, StyleEdit, TagId};
use crate::raster::{Page, Rasterizer};
use crate::types::PercentPoint;
use std::collections::HashMap;
use tiny_skia::Pixmap;

/// Identifies one page-load request. A result is applied only when both the
/// document and the generation still match the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub document_id: DocumentId,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied,
    /// The load failed; the document stays editable over a blank canvas.
    Unavailable,
    /// The session moved on before the load finished; the result was dropped.
    Stale,
}

/// Background pages of the current document.
#[derive(Debug, Clone, Default)]
pub enum PageState {
    #[default]
    Pending,
    Loaded(Vec<Page>),
    Unavailable {
        reason: String,
    },
}

/// Everything a session produced, keyed by document id.
#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    pub documents: Vec<Document>,
    pub song_form_styles: HashMap<DocumentId, SongFormStyle>,
    pub part_tags: HashMap<DocumentId, Vec<PartTag>>,
    pub composited_pages: HashMap<DocumentId, Vec<CompositedPage>>,
}

impl SessionOutcome {
    /// Outcome for documents that were never edited, for export without a session.
    pub fn unvisited(documents: Vec<Document>) -> Self {
        Self {
            documents,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[derive(Debug)]
pub enum SessionStart {
    Active(Session),
    /// No document carried a song form.
    Finished(SessionOutcome),
}

#[derive(Debug)]
pub enum Advance {
    Moved(usize),
    Finished(SessionOutcome),
}

#[derive(Debug)]
pub struct Session {
    documents: Vec<Document>,
    current_document: usize,
    current_page: usize,
    song_form_styles: HashMap<DocumentId, SongFormStyle>,
    part_tags: HashMap<DocumentId, Vec<PartTag>>,
    composited_pages: HashMap<DocumentId, Vec<CompositedPage>>,
    pages: PageState,
    generation: u64,
    next_tag_id: u64,
}

impl Session {
    /// Keeps only documents with at least one non-blank song-form label.
    pub fn start(documents: Vec<Document>) -> SessionStart {
        let total = documents.len();
        let documents: Vec<Document> = documents
            .into_iter()
            .filter(Document::has_song_form)
            .collect();
        tracing::info!(total, kept = documents.len(), "starting overlay session");
        if documents.is_empty() {
            return SessionStart::Finished(SessionOutcome::default());
        }
        let mut session = Session {
            documents,
            current_document: 0,
            current_page: 0,
            song_form_styles: HashMap::new(),
            part_tags: HashMap::new(),
            composited_pages: HashMap::new(),
            pages: PageState::Pending,
            generation: 0,
            next_tag_id: 1,
        };
        let first = session.documents[0].id.clone();
        session.ensure_default_style(&first);
        SessionStart::Active(session)
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn current_document_index(&self) -> usize {
        self.current_document
    }

    pub fn current_document(&self) -> &Document {
        &self.documents[self.current_document]
    }

    pub fn current_page_index(&self) -> usize {
        self.current_page
    }

    pub fn page_state(&self) -> &PageState {
        &self.pages
    }

    /// Pages the current document can show. A document without a sheet shows
    /// one blank page; `None` while pages are still loading.
    pub fn page_count(&self) -> Option<usize> {
        match &self.pages {
            PageState::Pending => None,
            PageState::Loaded(pages) => Some(pages.len()),
            PageState::Unavailable { .. } => Some(1),
        }
    }

    pub fn song_form_style(&self, id: &DocumentId) -> Option<&SongFormStyle> {
        self.song_form_styles.get(id)
    }

    pub fn part_tags(&self, id: &DocumentId) -> &[PartTag] {
        self.part_tags.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn composited_pages(&self, id: &DocumentId) -> Option<&[CompositedPage]> {
        self.composited_pages.get(id).map(Vec::as_slice)
    }

    /// Seeds the default style the first time a document is shown.
    pub fn ensure_default_style(&mut self, id: &DocumentId) -> &SongFormStyle {
        self.song_form_styles.entry(id.clone()).or_default()
    }

    pub fn go_to_document(&mut self, index: usize) -> Result<()> {
        if index >= self.documents.len() {
            return Err(OverlayError::UnknownDocument(format!("index {index}")));
        }
        if index == self.current_document {
            return Ok(());
        }
        self.current_document = index;
        self.current_page = 0;
        self.generation += 1;
        // Only the current document's pages stay resident.
        self.pages = PageState::Pending;
        let id = self.documents[index].id.clone();
        self.ensure_default_style(&id);
        tracing::debug!(document = %id, generation = self.generation, "document selected");
        Ok(())
    }

    pub fn previous_document(&mut self) -> Result<bool> {
        if self.current_document == 0 {
            return Ok(false);
        }
        self.go_to_document(self.current_document - 1)?;
        Ok(true)
    }

    /// Clamped to the pages available; returns the page now shown.
    pub fn set_page(&mut self, index: usize) -> usize {
        let last = self.page_count().unwrap_or(1).saturating_sub(1);
        self.current_page = index.min(last);
        self.current_page
    }

    pub fn next_page(&mut self) -> usize {
        self.set_page(self.current_page + 1)
    }

    pub fn previous_page(&mut self) -> usize {
        self.set_page(self.current_page.saturating_sub(1))
    }

    pub fn begin_page_load(&mut self) -> LoadTicket {
        LoadTicket {
            document_id: self.current_document().id.clone(),
            generation: self.generation,
        }
    }

    pub fn finish_page_load(&mut self, ticket: LoadTicket, result: Result<Vec<Page>>) -> LoadOutcome {
        if ticket.generation != self.generation || ticket.document_id != self.current_document().id
        {
            tracing::debug!(
                document = %ticket.document_id,
                generation = ticket.generation,
                "discarding stale page load"
            );
            return LoadOutcome::Stale;
        }
        match result {
            Ok(pages) if !pages.is_empty() => {
                tracing::debug!(document = %ticket.document_id, pages = pages.len(), "pages loaded");
                self.pages = PageState::Loaded(pages);
                self.set_page(self.current_page);
                LoadOutcome::Applied
            }
            Ok(_) => self.mark_unavailable(&ticket, "no pages".to_string()),
            Err(err) => self.mark_unavailable(&ticket, err.to_string()),
        }
    }

    fn mark_unavailable(&mut self, ticket: &LoadTicket, reason: String) -> LoadOutcome {
        tracing::warn!(document = %ticket.document_id, %reason, "sheet unavailable");
        self.pages = PageState::Unavailable { reason };
        self.current_page = 0;
        LoadOutcome::Unavailable
    }

    /// Loads the current document's pages through `rasterizer`.
    pub async fn load_current_pages(&mut self, rasterizer: &Rasterizer) -> LoadOutcome {
        let ticket = self.begin_page_load();
        let document = self.current_document().clone();
        let result = rasterizer.load_pages(&document).await;
        self.finish_page_load(ticket, result)
    }

    fn current_id(&self) -> DocumentId {
        self.current_document().id.clone()
    }

    pub fn add_part_tag(&mut self, label: &str, position: PercentPoint) -> Result<TagId> {
        let label = label.trim();
        if label.is_empty() {
            return Err(OverlayError::invalid_configuration("part tag label is empty"));
        }
        let id = TagId(self.next_tag_id);
        self.next_tag_id += 1;
        let tag = PartTag::new(id, label, position, self.current_page);
        self.part_tags.entry(self.current_id()).or_default().push(tag);
        Ok(id)
    }

    fn tag_mut(&mut self, id: TagId) -> Result<&mut PartTag> {
        let doc = self.current_id();
        self.part_tags
            .get_mut(&doc)
            .and_then(|tags| tags.iter_mut().find(|tag| tag.id == id))
            .ok_or(OverlayError::UnknownTag(id.0))
    }

    pub fn move_part_tag(&mut self, id: TagId, position: PercentPoint) -> Result<()> {
        self.tag_mut(id)?.set_position(position);
        Ok(())
    }

    pub fn edit_part_tag(&mut self, id: TagId, edit: &StyleEdit) -> Result<()> {
        self.tag_mut(id)?.apply(edit)
    }

    pub fn remove_part_tag(&mut self, id: TagId) -> Result<PartTag> {
        let doc = self.current_id();
        let tags = self
            .part_tags
            .get_mut(&doc)
            .ok_or(OverlayError::UnknownTag(id.0))?;
        let index = tags
            .iter()
            .position(|tag| tag.id == id)
            .ok_or(OverlayError::UnknownTag(id.0))?;
        Ok(tags.remove(index))
    }

    fn current_style_mut(&mut self) -> &mut SongFormStyle {
        let id = self.current_id();
        self.song_form_styles.entry(id).or_default()
    }

    pub fn move_song_form(&mut self, position: PercentPoint) {
        self.current_style_mut().set_position(position);
    }

    pub fn edit_song_form(&mut self, edit: &StyleEdit) -> Result<()> {
        self.current_style_mut().apply(edit)
    }

    /// Copies the current style onto every other document. Tags are untouched.
    pub fn apply_style_to_all(&mut self) -> usize {
        let style = self.current_style_mut().clone();
        let current = self.current_id();
        let mut copied = 0;
        for doc in &self.documents {
            if doc.id != current {
                self.song_form_styles.insert(doc.id.clone(), style.clone());
                copied += 1;
            }
        }
        copied
    }

    /// Composites every page of the current document and stores the result,
    /// replacing anything committed earlier. Returns the number of pages stored.
    pub fn commit_current(&mut self, compositor: &Compositor) -> Result<usize> {
        let document = self.current_document();
        let id = document.id.clone();
        let form_text = document.song_form_text();
        let style = self
            .song_form_styles
            .get(&id)
            .cloned()
            .unwrap_or_default();
        let tags = self.part_tags(&id);
        let scene = Scene {
            style: &style,
            form_text: &form_text,
            tags,
        };
        let committed = match &self.pages {
            PageState::Pending => {
                tracing::debug!(document = %id, "pages not loaded; nothing committed");
                return Ok(0);
            }
            PageState::Loaded(pages) => pages
                .iter()
                .map(|page| compositor.commit_page(Some(page), &scene, page.index))
                .collect::<Result<Vec<_>>>()?,
            PageState::Unavailable { .. } => vec![compositor.commit_page(None, &scene, 0)?],
        };
        let count = committed.len();
        self.composited_pages.insert(id, committed);
        Ok(count)
    }

    /// Commits the current document and moves to the next one, or finishes.
    pub fn advance(&mut self, compositor: &Compositor) -> Result<Advance> {
        self.commit_current(compositor)?;
        let next = self.current_document + 1;
        if next >= self.documents.len() {
            tracing::info!(documents = self.documents.len(), "session finished");
            return Ok(Advance::Finished(self.outcome()));
        }
        self.go_to_document(next)?;
        Ok(Advance::Moved(next))
    }

    /// The current page at preview size.
    pub fn preview(&self, compositor: &Compositor) -> Result<Pixmap> {
        let document = self.current_document();
        let form_text = document.song_form_text();
        let style = self
            .song_form_styles
            .get(&document.id)
            .cloned()
            .unwrap_or_default();
        let scene = Scene {
            style: &style,
            form_text: &form_text,
            tags: self.part_tags(&document.id),
        };
        let background = match &self.pages {
            PageState::Loaded(pages) => pages.get(self.current_page),
            _ => None,
        };
        compositor.preview(background, &scene, self.current_page)
    }

    pub fn outcome(&self) -> SessionOutcome {
        SessionOutcome {
            documents: self.documents.clone(),
            song_form_styles: self.song_form_styles.clone(),
            part_tags: self.part_tags.clone(),
            composited_pages: self.composited_pages.clone(),
        }
    }
}

impl OverlayTarget for Session {
    fn song_form_anchor(&self) -> Option<PercentPoint> {
        if !self.current_document().has_song_form() {
            return None;
        }
        self.song_form_styles
            .get(&self.current_document().id)
            .map(SongFormStyle::position)
    }

    fn page_tag_anchors(&self) -> Vec<(TagId, PercentPoint)> {
        self.part_tags(&self.current_document().id)
            .iter()
            .filter(|tag| tag.page_index == self.current_page)
            .map(|tag| (tag.id, tag.position()))
            .collect()
    }

    fn move_song_form(&mut self, point: PercentPoint) -> Result<()> {
        Session::move_song_form(self, point);
        Ok(())
    }

    fn move_part_tag(&mut self, id: TagId, point: PercentPoint) -> Result<()> {
        Session::move_part_tag(self, id, point)
    }

    fn add_part_tag(&mut self, label: &str, point: PercentPoint) -> Result<TagId> {
        Session::add_part_tag(self, label, point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::font::FontRegistry;
    use crate::interaction::{InteractionController, PointerSample, SurfaceRect};
    use crate::types::PageSize;
    use std::sync::Arc;

    const SIZE: PageSize = PageSize {
        width: 124,
        height: 175,
    };

    fn docs() -> Vec<Document> {
        vec![
            Document::new("a", "Amazing Grace").with_labels(["V1", "C"]),
            Document::new("b", "Blessed Be").with_labels(["I", "V", "C", "B"]),
            Document::new("c", "Cornerstone").with_labels(["V1"]),
        ]
    }

    fn active(documents: Vec<Document>) -> Session {
        match Session::start(documents) {
            SessionStart::Active(session) => session,
            SessionStart::Finished(_) => panic!("expected an active session"),
        }
    }

    fn blank_pages(count: usize) -> Vec<Page> {
        (0..count)
            .map(|index| {
                let mut pixmap = Pixmap::new(SIZE.width, SIZE.height).unwrap();
                pixmap.fill(tiny_skia::Color::WHITE);
                Page::new(index, pixmap)
            })
            .collect()
    }

    fn compositor() -> Compositor {
        Compositor::new(Arc::new(FontRegistry::isolated()), SIZE)
    }

    #[test]
    fn start_filters_documents_without_song_form() {
        let documents = vec![
            Document::new("1", "One"),
            Document::new("2", "Two").with_labels(["C"]),
            Document::new("3", "Three").with_labels(["  "]),
        ];
        let session = active(documents);
        assert_eq!(session.documents().len(), 1);
        assert_eq!(session.current_document().id.as_str(), "2");
        assert_eq!(
            session.song_form_style(&DocumentId::from("2")),
            Some(&SongFormStyle::default())
        );
    }

    #[test]
    fn empty_filtered_list_finishes_immediately() {
        match Session::start(vec![Document::new("x", "No Labels")]) {
            SessionStart::Finished(outcome) => assert!(outcome.is_empty()),
            SessionStart::Active(_) => panic!("nothing to edit"),
        }
    }

    #[test]
    fn stale_load_is_never_applied() {
        let mut session = active(docs());
        let ticket = session.begin_page_load();
        session.go_to_document(1).unwrap();
        let outcome = session.finish_page_load(ticket, Ok(blank_pages(3)));
        assert_eq!(outcome, LoadOutcome::Stale);
        assert!(matches!(session.page_state(), PageState::Pending));

        // Returning to the same document still invalidates the old ticket.
        let ticket = session.begin_page_load();
        session.go_to_document(0).unwrap();
        session.go_to_document(1).unwrap();
        assert_eq!(session.finish_page_load(ticket, Ok(blank_pages(1))), LoadOutcome::Stale);
    }

    #[test]
    fn page_cursor_resets_and_clamps() {
        let mut session = active(docs());
        let ticket = session.begin_page_load();
        assert_eq!(session.finish_page_load(ticket, Ok(blank_pages(3))), LoadOutcome::Applied);
        assert_eq!(session.next_page(), 1);
        assert_eq!(session.set_page(10), 2);
        assert_eq!(session.previous_page(), 1);
        session.go_to_document(2).unwrap();
        assert_eq!(session.current_page_index(), 0);
        assert!(session.previous_document().unwrap());
        assert_eq!(session.current_document_index(), 1);
    }

    #[test]
    fn failed_decode_still_accepts_edits_and_commits_blank_page() {
        let mut session = active(docs());
        let ticket = session.begin_page_load();
        let outcome = session.finish_page_load(ticket, Err(OverlayError::decode("broken pdf")));
        assert_eq!(outcome, LoadOutcome::Unavailable);
        assert_eq!(session.page_count(), Some(1));
        let tag = session.add_part_tag("C", PercentPoint::new(50.0, 50.0)).unwrap();
        session.edit_part_tag(tag, &StyleEdit::FontSize(30.0)).unwrap();
        session.edit_song_form(&StyleEdit::Color("#ff0000".into())).unwrap();
        assert_eq!(session.commit_current(&compositor()).unwrap(), 1);
        let id = session.current_document().id.clone();
        assert_eq!(session.composited_pages(&id).unwrap().len(), 1);
    }

    #[test]
    fn advance_commits_every_page_and_replaces_earlier_results() {
        let compositor = compositor();
        let mut session = active(docs());
        let ticket = session.begin_page_load();
        session.finish_page_load(ticket, Ok(blank_pages(3)));
        session.commit_current(&compositor).unwrap();
        assert!(matches!(session.advance(&compositor).unwrap(), Advance::Moved(1)));
        let first = DocumentId::from("a");
        let pages = session.composited_pages(&first).unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(
            pages.iter().map(|p| p.page_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(matches!(session.page_state(), PageState::Pending));
    }

    #[test]
    fn advancing_unloaded_document_commits_nothing() {
        let compositor = compositor();
        let mut session = active(docs());
        session.advance(&compositor).unwrap();
        session.advance(&compositor).unwrap();
        let Advance::Finished(outcome) = session.advance(&compositor).unwrap() else {
            panic!("last advance finishes the session");
        };
        assert_eq!(outcome.documents.len(), 3);
        assert!(outcome.composited_pages.is_empty());
        assert_eq!(outcome.song_form_styles.len(), 3);
    }

    #[test]
    fn apply_to_all_copies_style_exactly_and_leaves_tags() {
        let mut session = active(docs());
        session.go_to_document(1).unwrap();
        let tag = session.add_part_tag("B", PercentPoint::new(20.0, 30.0)).unwrap();
        session.go_to_document(0).unwrap();
        session.move_song_form(PercentPoint::new(33.3, 12.7));
        session.edit_song_form(&StyleEdit::FontSize(27.5)).unwrap();
        session.edit_song_form(&StyleEdit::Opacity(0.65)).unwrap();
        let before_tags = session.part_tags(&DocumentId::from("b")).to_vec();
        assert_eq!(session.apply_style_to_all(), 2);

        let source = session.song_form_style(&DocumentId::from("a")).unwrap().clone();
        for id in ["b", "c"] {
            let copy = session.song_form_style(&DocumentId::from(id)).unwrap();
            assert_eq!(copy.x.to_bits(), source.x.to_bits());
            assert_eq!(copy.y.to_bits(), source.y.to_bits());
            assert_eq!(copy.font_size.to_bits(), source.font_size.to_bits());
            assert_eq!(copy.opacity.to_bits(), source.opacity.to_bits());
            assert_eq!(copy.color, source.color);
        }
        assert_eq!(session.part_tags(&DocumentId::from("b")), before_tags.as_slice());
        assert_eq!(before_tags[0].id, tag);
    }

    #[test]
    fn tags_are_scoped_to_page_and_document() {
        let mut session = active(docs());
        let ticket = session.begin_page_load();
        session.finish_page_load(ticket, Ok(blank_pages(2)));
        session.set_page(1);
        let id = session.add_part_tag("PC", PercentPoint::new(40.0, 40.0)).unwrap();
        assert_eq!(session.part_tags(&DocumentId::from("a"))[0].page_index, 1);
        assert!(session.page_tag_anchors().len() == 1);
        session.set_page(0);
        assert!(session.page_tag_anchors().is_empty());
        session.go_to_document(1).unwrap();
        assert!(matches!(
            session.move_part_tag(id, PercentPoint::new(1.0, 1.0)),
            Err(OverlayError::UnknownTag(_))
        ));
        session.go_to_document(0).unwrap();
        assert_eq!(session.remove_part_tag(id).unwrap().label, "PC");
        assert!(session.part_tags(&DocumentId::from("a")).is_empty());
    }

    #[test]
    fn drag_round_trips_any_safe_position() {
        let mut session = active(docs());
        let ticket = session.begin_page_load();
        session.finish_page_load(ticket, Ok(blank_pages(1)));
        let surface = SurfaceRect::new(0.0, 0.0, 1000.0, 1000.0);
        let mut ctl = InteractionController::new(surface);
        for (x, y) in [(5.0, 3.0), (95.0, 97.0), (50.0, 50.0), (12.5, 88.0)] {
            let anchor = session.song_form_anchor().unwrap();
            let down = PointerSample::mouse(anchor.x * 10.0, anchor.y * 10.0);
            ctl.pointer_down(&session, &down).unwrap();
            ctl.pointer_move(&mut session, &PointerSample::mouse(x * 10.0, y * 10.0))
                .unwrap();
            ctl.pointer_up(&mut session, &PointerSample::mouse(x * 10.0, y * 10.0))
                .unwrap();
            session.commit_current(&compositor()).unwrap();
            let style = session.song_form_style(&DocumentId::from("a")).unwrap();
            assert!((style.x - x).abs() < 1e-4 && (style.y - y).abs() < 1e-4);
        }
    }

    #[test]
    fn preview_uses_preview_size() {
        let session = active(docs());
        let compositor = compositor().with_preview_width(62);
        let preview = session.preview(&compositor).unwrap();
        assert_eq!(preview.width(), 62);
    }
}
