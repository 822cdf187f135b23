use crate::error::Result;
use crate::model::{TagId, clamp_position};
use crate::types::PercentPoint;

/// Precision class of the device that produced a pointer sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputKind {
    /// Mouse or stylus.
    #[default]
    Fine,
    /// Finger on a touch screen.
    Coarse,
}

/// Half-extents, in page percent, of the box around an anchor that counts as a hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitTolerance {
    pub tag: (f32, f32),
    pub song_form: (f32, f32),
}

impl InputKind {
    pub fn tolerance(self) -> HitTolerance {
        match self {
            // The song-form label renders wide, so its box is wide too.
            InputKind::Fine => HitTolerance {
                tag: (3.0, 2.0),
                song_form: (12.0, 2.0),
            },
            InputKind::Coarse => HitTolerance {
                tag: (7.0, 4.0),
                song_form: (22.0, 4.0),
            },
        }
    }
}

/// One mouse or touch sample in client coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerSample {
    pub client_x: f32,
    pub client_y: f32,
    pub kind: InputKind,
}

impl PointerSample {
    pub fn mouse(client_x: f32, client_y: f32) -> Self {
        Self {
            client_x,
            client_y,
            kind: InputKind::Fine,
        }
    }

    pub fn touch(client_x: f32, client_y: f32) -> Self {
        Self {
            client_x,
            client_y,
            kind: InputKind::Coarse,
        }
    }
}

/// Bounding box of the preview surface in client coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SurfaceRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl SurfaceRect {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn contains(&self, sample: &PointerSample) -> bool {
        sample.client_x >= self.left
            && sample.client_x <= self.left + self.width
            && sample.client_y >= self.top
            && sample.client_y <= self.top + self.height
    }
}

/// Container-relative position of a sample in percent. Not clamped; `None`
/// when the surface has no area or the sample is not finite.
pub fn pointer_position(sample: &PointerSample, surface: &SurfaceRect) -> Option<PercentPoint> {
    if !(surface.width > 0.0 && surface.height > 0.0) {
        return None;
    }
    let point = PercentPoint::new(
        (sample.client_x - surface.left) / surface.width * 100.0,
        (sample.client_y - surface.top) / surface.height * 100.0,
    );
    point.is_finite().then_some(point)
}

/// Overlay state the controller reads for hit testing and mutates while dragging.
pub trait OverlayTarget {
    /// Anchor of the current document's song-form label, if it has one.
    fn song_form_anchor(&self) -> Option<PercentPoint>;

    /// Tags on the currently displayed page, in list order.
    fn page_tag_anchors(&self) -> Vec<(TagId, PercentPoint)>;

    fn move_song_form(&mut self, point: PercentPoint) -> Result<()>;

    fn move_part_tag(&mut self, id: TagId, point: PercentPoint) -> Result<()>;

    /// Adds a tag on the currently displayed page.
    fn add_part_tag(&mut self, label: &str, point: PercentPoint) -> Result<TagId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragTarget {
    SongForm,
    PartTag(TagId),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum DragState {
    #[default]
    Idle,
    Dragging(DragTarget),
    /// A palette entry is being dragged toward the page.
    PlacingNewTag {
        label: String,
        hover: Option<PercentPoint>,
    },
}

fn within(anchor: PercentPoint, point: PercentPoint, (half_w, half_h): (f32, f32)) -> bool {
    (point.x - anchor.x).abs() <= half_w && (point.y - anchor.y).abs() <= half_h
}

/// The song form is tested first; among tags the last match in list order wins.
pub fn hit_test<T: OverlayTarget + ?Sized>(
    target: &T,
    point: PercentPoint,
    kind: InputKind,
) -> Option<DragTarget> {
    let tolerance = kind.tolerance();
    let on_song_form = target
        .song_form_anchor()
        .is_some_and(|anchor| within(anchor, point, tolerance.song_form));
    if on_song_form {
        return Some(DragTarget::SongForm);
    }
    target
        .page_tag_anchors()
        .into_iter()
        .filter(|(_, anchor)| within(*anchor, point, tolerance.tag))
        .last()
        .map(|(id, _)| DragTarget::PartTag(id))
}

/// Pointer-driven drag state machine over the preview surface.
#[derive(Debug, Clone, Default)]
pub struct InteractionController {
    state: DragState,
    surface: SurfaceRect,
}

impl InteractionController {
    pub fn new(surface: SurfaceRect) -> Self {
        Self {
            state: DragState::Idle,
            surface,
        }
    }

    pub fn state(&self) -> &DragState {
        &self.state
    }

    pub fn surface(&self) -> SurfaceRect {
        self.surface
    }

    /// The preview surface moved or resized.
    pub fn set_surface(&mut self, surface: SurfaceRect) {
        self.surface = surface;
    }

    pub fn pointer_down<T: OverlayTarget + ?Sized>(
        &mut self,
        target: &T,
        sample: &PointerSample,
    ) -> Option<DragTarget> {
        if !matches!(self.state, DragState::Idle) {
            return None;
        }
        let point = pointer_position(sample, &self.surface)?;
        let hit = hit_test(target, point, sample.kind)?;
        self.state = DragState::Dragging(hit);
        Some(hit)
    }

    /// Live update: the dragged overlay is moved on every sample.
    pub fn pointer_move<T: OverlayTarget + ?Sized>(
        &mut self,
        target: &mut T,
        sample: &PointerSample,
    ) -> Result<()> {
        let Some(point) = pointer_position(sample, &self.surface) else {
            return Ok(());
        };
        match &mut self.state {
            DragState::Idle => Ok(()),
            DragState::Dragging(DragTarget::SongForm) => {
                target.move_song_form(clamp_position(point))
            }
            DragState::Dragging(DragTarget::PartTag(id)) => {
                target.move_part_tag(*id, clamp_position(point))
            }
            DragState::PlacingNewTag { hover, .. } => {
                *hover = self
                    .surface
                    .contains(sample)
                    .then(|| clamp_position(point));
                Ok(())
            }
        }
    }

    /// Ends a drag. Returns the id of a tag created by a palette drop.
    pub fn pointer_up<T: OverlayTarget + ?Sized>(
        &mut self,
        target: &mut T,
        sample: &PointerSample,
    ) -> Result<Option<TagId>> {
        match std::mem::take(&mut self.state) {
            DragState::PlacingNewTag { label, .. } if self.surface.contains(sample) => {
                let Some(point) = pointer_position(sample, &self.surface) else {
                    return Ok(None);
                };
                let id = target.add_part_tag(&label, clamp_position(point))?;
                tracing::debug!(tag = %id, label = %label, "placed part tag");
                Ok(Some(id))
            }
            _ => Ok(None),
        }
    }

    /// Pointer left the surface: any drag or pending placement is dropped.
    pub fn pointer_leave(&mut self) {
        self.state = DragState::Idle;
    }

    pub fn begin_palette_drag(&mut self, label: impl Into<String>) {
        self.state = DragState::PlacingNewTag {
            label: label.into(),
            hover: None,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OverlayError;
    use crate::model::PartTag;

    #[derive(Default)]
    struct FakePage {
        song_form: Option<PercentPoint>,
        tags: Vec<PartTag>,
        next_id: u64,
    }

    impl OverlayTarget for FakePage {
        fn song_form_anchor(&self) -> Option<PercentPoint> {
            self.song_form
        }

        fn page_tag_anchors(&self) -> Vec<(TagId, PercentPoint)> {
            self.tags.iter().map(|t| (t.id, t.position())).collect()
        }

        fn move_song_form(&mut self, point: PercentPoint) -> Result<()> {
            self.song_form = Some(point);
            Ok(())
        }

        fn move_part_tag(&mut self, id: TagId, point: PercentPoint) -> Result<()> {
            let tag = self
                .tags
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or(OverlayError::UnknownTag(id.0))?;
            tag.set_position(point);
            Ok(())
        }

        fn add_part_tag(&mut self, label: &str, point: PercentPoint) -> Result<TagId> {
            self.next_id += 1;
            let id = TagId(self.next_id);
            self.tags.push(PartTag::new(id, label, point, 0));
            Ok(id)
        }
    }

    fn surface() -> SurfaceRect {
        SurfaceRect::new(100.0, 50.0, 200.0, 400.0)
    }

    #[test]
    fn mouse_and_touch_normalize_identically() {
        let s = surface();
        let mouse = pointer_position(&PointerSample::mouse(200.0, 250.0), &s).unwrap();
        let touch = pointer_position(&PointerSample::touch(200.0, 250.0), &s).unwrap();
        assert_eq!(mouse, PercentPoint::new(50.0, 50.0));
        assert_eq!(mouse, touch);
        let outside = pointer_position(&PointerSample::mouse(80.0, 50.0), &s).unwrap();
        assert_eq!(outside, PercentPoint::new(-10.0, 0.0));
        assert!(pointer_position(&PointerSample::mouse(1.0, 1.0), &SurfaceRect::default()).is_none());
    }

    #[test]
    fn song_form_wins_over_overlapping_tag() {
        let mut page = FakePage {
            song_form: Some(PercentPoint::new(50.0, 4.0)),
            ..FakePage::default()
        };
        page.add_part_tag("C", PercentPoint::new(52.0, 5.0)).unwrap();
        let hit = hit_test(&page, PercentPoint::new(52.0, 5.0), InputKind::Fine);
        assert_eq!(hit, Some(DragTarget::SongForm));
    }

    #[test]
    fn last_matching_tag_wins() {
        let mut page = FakePage::default();
        let first = page.add_part_tag("V1", PercentPoint::new(40.0, 40.0)).unwrap();
        let second = page.add_part_tag("C", PercentPoint::new(41.0, 40.5)).unwrap();
        assert_ne!(first, second);
        let hit = hit_test(&page, PercentPoint::new(40.5, 40.2), InputKind::Fine);
        assert_eq!(hit, Some(DragTarget::PartTag(second)));
    }

    #[test]
    fn touch_tolerance_is_larger() {
        let mut page = FakePage::default();
        let id = page.add_part_tag("B", PercentPoint::new(50.0, 50.0)).unwrap();
        let near = PercentPoint::new(55.0, 53.0);
        assert_eq!(hit_test(&page, near, InputKind::Fine), None);
        assert_eq!(hit_test(&page, near, InputKind::Coarse), Some(DragTarget::PartTag(id)));
        let page = FakePage {
            song_form: Some(PercentPoint::new(50.0, 4.0)),
            ..FakePage::default()
        };
        let wide = PercentPoint::new(68.0, 4.0);
        assert_eq!(hit_test(&page, wide, InputKind::Fine), None);
        assert_eq!(hit_test(&page, wide, InputKind::Coarse), Some(DragTarget::SongForm));
    }

    #[test]
    fn drag_moves_live_and_clamps() {
        let mut page = FakePage {
            song_form: Some(PercentPoint::new(50.0, 4.0)),
            ..FakePage::default()
        };
        let mut ctl = InteractionController::new(surface());
        // (50%, 4%) of the surface.
        let down = PointerSample::mouse(200.0, 66.0);
        assert_eq!(ctl.pointer_down(&page, &down), Some(DragTarget::SongForm));
        ctl.pointer_move(&mut page, &PointerSample::mouse(260.0, 250.0)).unwrap();
        assert_eq!(page.song_form, Some(PercentPoint::new(80.0, 50.0)));
        ctl.pointer_move(&mut page, &PointerSample::mouse(-500.0, 9000.0)).unwrap();
        assert_eq!(page.song_form, Some(PercentPoint::new(5.0, 97.0)));
        ctl.pointer_leave();
        assert_eq!(ctl.state(), &DragState::Idle);
        ctl.pointer_move(&mut page, &PointerSample::mouse(200.0, 250.0)).unwrap();
        assert_eq!(page.song_form, Some(PercentPoint::new(5.0, 97.0)));
    }

    #[test]
    fn miss_stays_idle() {
        let page = FakePage::default();
        let mut ctl = InteractionController::new(surface());
        assert_eq!(ctl.pointer_down(&page, &PointerSample::mouse(200.0, 250.0)), None);
        assert_eq!(ctl.state(), &DragState::Idle);
    }

    #[test]
    fn palette_drop_inside_adds_tag_outside_discards() {
        let mut page = FakePage::default();
        let mut ctl = InteractionController::new(surface());
        ctl.begin_palette_drag("PC");
        ctl.pointer_move(&mut page, &PointerSample::touch(200.0, 250.0)).unwrap();
        assert!(matches!(
            ctl.state(),
            DragState::PlacingNewTag { hover: Some(_), .. }
        ));
        let id = ctl
            .pointer_up(&mut page, &PointerSample::touch(102.0, 52.0))
            .unwrap()
            .unwrap();
        let tag = page.tags.iter().find(|t| t.id == id).unwrap();
        assert_eq!(tag.label, "PC");
        assert_eq!(tag.position(), PercentPoint::new(5.0, 3.0));

        ctl.begin_palette_drag("B");
        let dropped = ctl
            .pointer_up(&mut page, &PointerSample::mouse(10.0, 10.0))
            .unwrap();
        assert_eq!(dropped, None);
        assert_eq!(page.tags.len(), 1);
        assert_eq!(ctl.state(), &DragState::Idle);
    }
}
