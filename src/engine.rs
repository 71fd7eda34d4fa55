// ============================================================================
// ENGINE — document facade: strokes, layers, transforms, history, export
// ============================================================================

use std::collections::VecDeque;

use image::{Rgba, RgbaImage};
use uuid::Uuid;

use crate::canvas::{BlendMode, CanvasState, Layer, PixelBuffer, Sampling};
use crate::components::history::{HistoryEntry, HistoryStack};
use crate::components::tools::{
    self, PressureHistory, PressureSettings, Tool, ToolContext,
};
use crate::io::LayerRecord;
use crate::ops::transform::{CommitOutcome, TransformDelta, TransformSession};
use crate::viewport::{self, ViewTransform};

/// Normalized pointer sample in screen space.  `pressure == None` (mouse,
/// untracked stylus) is treated as 0.5.
#[derive(Clone, Copy, Debug)]
pub struct PointerEvent {
    pub x: f32,
    pub y: f32,
    pub pressure: Option<f32>,
    pub primary: bool,
}

/// Structural change notifications for list/thumbnail UIs, drained with
/// [`Engine::poll_events`] instead of polled per-frame.
#[derive(Clone, Debug, PartialEq)]
pub enum DocumentEvent {
    LayerAdded { id: Uuid, index: usize },
    LayerRemoved { id: Uuid, index: usize },
    LayerMoved { id: Uuid, from: usize, to: usize },
    LayerRenamed { id: Uuid },
    VisibilityChanged { id: Uuid, visible: bool },
    OpacityChanged { id: Uuid, opacity: f32 },
    BlendModeChanged { id: Uuid, blend_mode: BlendMode },
    ActiveLayerChanged { index: usize },
    /// Thumbnail-affecting pixel content changed.
    ContentChanged { id: Uuid },
}

/// Read-only row for layer panels.
#[derive(Clone, Debug)]
pub struct LayerInfo {
    pub id: Uuid,
    pub name: String,
    pub visible: bool,
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub is_background: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveDirection {
    Up,
    Down,
    Top,
    Bottom,
}

/// Invoked after every discrete completed edit (stroke end, fill, transform
/// commit) so a persistence collaborator can encode the layer.  Failure is
/// logged and dropped — it never rolls back the in-memory edit.
pub type EditCallback = Box<dyn FnMut(Uuid, &PixelBuffer) -> Result<(), String>>;

/// Coalesces recomposite requests: however many pointer-move events arrive
/// before the next refresh, at most one composite runs.  Cancelling is
/// idempotent; cancelling with nothing scheduled is a no-op.
#[derive(Default)]
struct RecompositeScheduler {
    pending: bool,
}

impl RecompositeScheduler {
    fn schedule(&mut self) {
        self.pending = true;
    }

    fn cancel(&mut self) {
        self.pending = false;
    }

    fn take(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    fn is_pending(&self) -> bool {
        self.pending
    }
}

/// In-flight freehand stroke.
struct StrokeState {
    layer_index: usize,
    last_point: (f32, f32),
    last_size: f32,
}

pub struct Engine {
    state: CanvasState,
    history: HistoryStack,
    /// At most one transform session document-wide.
    session: Option<TransformSession>,
    tool: ToolContext,
    pressure_settings: PressureSettings,
    pressure: PressureHistory,
    stroke: Option<StrokeState>,
    view: ViewTransform,
    sampling: Sampling,
    scheduler: RecompositeScheduler,
    /// The composited display buffer, refreshed from the dirty rect.
    display: PixelBuffer,
    events: VecDeque<DocumentEvent>,
    edit_callback: Option<EditCallback>,
}

impl Engine {
    pub fn new(width: u32, height: u32) -> Result<Self, String> {
        if width == 0 || height == 0 {
            return Err(format!("invalid document size {}×{}", width, height));
        }
        let state = CanvasState::new(width, height);
        let mut engine = Self::from_state(state);
        engine.history.push(HistoryEntry::capture(&engine.state, "New document"));
        Ok(engine)
    }

    /// Rehydrate from a persistence collaborator's ordered records
    /// (back-to-front).  A record with missing or mis-sized pixel data
    /// yields a blank layer rather than failing the whole load; an empty
    /// record list aborts initialization.
    pub fn from_records(
        records: Vec<LayerRecord>,
        width: u32,
        height: u32,
    ) -> Result<Self, String> {
        if width == 0 || height == 0 {
            return Err(format!("invalid document size {}×{}", width, height));
        }
        if records.is_empty() {
            return Err("cannot initialize a document with no layers".to_string());
        }

        let layers: Vec<Layer> = records
            .into_iter()
            .enumerate()
            .map(|(i, record)| {
                let pixels = if record.pixel_data.is_empty() {
                    PixelBuffer::new(width, height)
                } else {
                    match PixelBuffer::from_raw_rgba(width, height, &record.pixel_data) {
                        Some(buf) => buf,
                        None => {
                            crate::log_warn!(
                                "layer '{}': pixel data length {} does not match {}×{}, using blank layer",
                                record.name,
                                record.pixel_data.len(),
                                width,
                                height
                            );
                            PixelBuffer::new(width, height)
                        }
                    }
                };
                Layer {
                    id: record.layer_id,
                    name: record.name,
                    visible: record.visible,
                    opacity: record.opacity.clamp(0.0, 1.0),
                    blend_mode: BlendMode::from_u8(record.blend_mode),
                    pixels,
                    matrix: crate::matrix::AffineMatrix::identity(),
                    is_background: i == 0,
                    gpu_generation: 0,
                }
            })
            .collect();

        let mut state = CanvasState::new(width, height);
        state.layers = layers;
        state.active_layer_index = 0;

        let mut engine = Self::from_state(state);
        engine.history.push(HistoryEntry::capture(&engine.state, "Load document"));
        Ok(engine)
    }

    fn from_state(state: CanvasState) -> Self {
        let display = PixelBuffer::new(state.width, state.height);
        let mut engine = Self {
            state,
            history: HistoryStack::default(),
            session: None,
            tool: ToolContext::default(),
            pressure_settings: PressureSettings::default(),
            pressure: PressureHistory::default(),
            stroke: None,
            view: ViewTransform::default(),
            sampling: Sampling::default(),
            scheduler: RecompositeScheduler::default(),
            display,
            events: VecDeque::new(),
            edit_callback: None,
        };
        engine.state.mark_dirty(None);
        engine.recomposite_now();
        engine
    }

    // -- configuration ------------------------------------------------------

    pub fn set_tool(&mut self, tool: Tool) {
        self.tool.tool = tool;
    }

    pub fn set_tool_color(&mut self, color: Rgba<u8>) {
        self.tool.color = color;
    }

    pub fn set_base_size(&mut self, size: f32) {
        self.tool.base_size = size.max(0.1);
    }

    pub fn set_tool_opacity(&mut self, opacity: f32) {
        self.tool.opacity = opacity.clamp(0.0, 1.0);
    }

    pub fn set_fill_tolerance(&mut self, tolerance: f32) {
        self.tool.fill_tolerance = tolerance.max(0.0);
    }

    pub fn tool_context(&self) -> &ToolContext {
        &self.tool
    }

    pub fn set_view(&mut self, view: ViewTransform) {
        self.view = view;
    }

    pub fn set_sampling(&mut self, sampling: Sampling) {
        self.sampling = sampling;
    }

    pub fn set_pressure_settings(&mut self, settings: PressureSettings) {
        self.pressure_settings = settings;
    }

    pub fn set_edit_callback(&mut self, callback: EditCallback) {
        self.edit_callback = Some(callback);
    }

    // -- read-only queries --------------------------------------------------

    pub fn width(&self) -> u32 {
        self.state.width
    }

    pub fn height(&self) -> u32 {
        self.state.height
    }

    pub fn canvas(&self) -> &CanvasState {
        &self.state
    }

    pub fn layers(&self) -> &[Layer] {
        &self.state.layers
    }

    pub fn active_layer_index(&self) -> usize {
        self.state.active_layer_index
    }

    /// Back-to-front snapshot of layer metadata for list UIs.
    pub fn layer_hierarchy(&self) -> Vec<LayerInfo> {
        self.state
            .layers
            .iter()
            .map(|l| LayerInfo {
                id: l.id,
                name: l.name.clone(),
                visible: l.visible,
                opacity: l.opacity,
                blend_mode: l.blend_mode,
                is_background: l.is_background,
            })
            .collect()
    }

    /// The composited display buffer as of the last recomposite.
    pub fn display(&self) -> &PixelBuffer {
        &self.display
    }

    /// Drain pending structural-change notifications.
    pub fn poll_events(&mut self) -> Vec<DocumentEvent> {
        self.events.drain(..).collect()
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn transform_active(&self) -> bool {
        self.session.is_some()
    }

    // -- rendering ----------------------------------------------------------

    /// Host refresh tick: runs the one coalesced recomposite, if any.
    pub fn on_refresh(&mut self) {
        if self.scheduler.take() {
            self.recomposite_now();
        }
    }

    pub fn recomposite_pending(&self) -> bool {
        self.scheduler.is_pending()
    }

    /// Cancel any scheduled recomposite and run one synchronously — used on
    /// pointer-up so the final frame always reflects the final state.
    pub fn force_recomposite(&mut self) {
        self.scheduler.cancel();
        self.recomposite_now();
    }

    fn recomposite_now(&mut self) {
        let rect = self.state.dirty.take();
        if rect.is_empty() {
            return;
        }
        self.state
            .composite_region(rect, &mut self.display, self.sampling);
    }

    /// Flatten all visible layers into a single opaque image for export.
    pub fn export_flattened(&self) -> RgbaImage {
        self.state.flatten()
    }

    // -- stroke handling ----------------------------------------------------

    /// Map a screen point through the viewport into canvas space.
    fn to_canvas(&self, ev: &PointerEvent) -> Option<(f32, f32)> {
        viewport::screen_to_canvas((ev.x, ev.y), &self.view)
    }

    /// Tool color with the context opacity folded into its alpha.
    fn stroke_color(&self) -> Rgba<u8> {
        let mut color = self.tool.color;
        color[3] = (color[3] as f32 * self.tool.opacity).round().clamp(0.0, 255.0) as u8;
        color
    }

    /// True when the active layer can take a stroke right now: it exists,
    /// is visible, and is not mid-transform (its matrix is identity, so
    /// layer-local space equals canvas space).
    fn stroke_target(&self) -> Option<usize> {
        if self.session.is_some() {
            return None;
        }
        let layer = self.state.active_layer()?;
        if !layer.visible || !layer.matrix.is_identity() {
            return None;
        }
        Some(self.state.active_layer_index)
    }

    /// Begin a stroke (pen/eraser) or perform a fill (bucket).  Returns
    /// false for benign invalid-state situations — no active layer, hidden
    /// layer, transform in progress — which are silently ignored.
    pub fn stroke_begin(&mut self, ev: PointerEvent) -> bool {
        if !ev.primary {
            return false;
        }
        let Some(layer_index) = self.stroke_target() else {
            return false;
        };
        let Some((cx, cy)) = self.to_canvas(&ev) else {
            return false;
        };

        match self.tool.tool {
            Tool::Bucket => self.bucket_fill(layer_index, cx, cy),
            Tool::Pen | Tool::Eraser => {
                self.pressure.clear();
                let size = tools::effective_stroke_size(
                    self.tool.base_size,
                    ev.pressure.unwrap_or(0.5),
                    &mut self.pressure,
                    &self.pressure_settings,
                );
                let color = self.stroke_color();
                let is_eraser = self.tool.tool == Tool::Eraser;

                let layer = &mut self.state.layers[layer_index];
                tools::stamp_circle(
                    &mut layer.pixels,
                    &mut self.state.dirty,
                    cx,
                    cy,
                    size / 2.0,
                    color,
                    is_eraser,
                );
                layer.mark_content_changed();

                self.stroke = Some(StrokeState {
                    layer_index,
                    last_point: (cx, cy),
                    last_size: size,
                });
                self.scheduler.schedule();
                true
            }
        }
    }

    /// Extend the active stroke to a new pointer position.  Points are
    /// applied in arrival order; the dirty rect is extended before the
    /// coalesced recomposite can observe it.
    pub fn stroke_move(&mut self, ev: PointerEvent) -> bool {
        let Some(stroke) = &self.stroke else {
            return false;
        };
        let layer_index = stroke.layer_index;
        let (lx, ly) = stroke.last_point;
        let last_size = stroke.last_size;

        let Some((cx, cy)) = self.to_canvas(&ev) else {
            return false;
        };
        if layer_index >= self.state.layers.len() {
            self.stroke = None;
            return false;
        }

        let size = tools::effective_stroke_size(
            self.tool.base_size,
            ev.pressure.unwrap_or(0.5),
            &mut self.pressure,
            &self.pressure_settings,
        );
        let color = self.stroke_color();
        let is_eraser = self.tool.tool == Tool::Eraser;

        let layer = &mut self.state.layers[layer_index];
        tools::stamp_line(
            &mut layer.pixels,
            &mut self.state.dirty,
            lx,
            ly,
            cx,
            cy,
            |t| last_size + (size - last_size) * t,
            color,
            is_eraser,
        );
        layer.mark_content_changed();

        self.stroke = Some(StrokeState {
            layer_index,
            last_point: (cx, cy),
            last_size: size,
        });
        self.scheduler.schedule();
        true
    }

    /// Finish the stroke: cancel the deferred recomposite in favor of an
    /// immediate one, record history, and notify the persistence and UI
    /// collaborators.
    pub fn stroke_end(&mut self, ev: PointerEvent) -> bool {
        if self.stroke.is_some() {
            self.stroke_move(ev);
        }
        let Some(stroke) = self.stroke.take() else {
            return false;
        };

        self.force_recomposite();

        let description = match self.tool.tool {
            Tool::Eraser => "Eraser stroke",
            _ => "Pen stroke",
        };
        self.history.push(HistoryEntry::capture(&self.state, description));
        self.after_edit(stroke.layer_index);
        true
    }

    fn bucket_fill(&mut self, layer_index: usize, cx: f32, cy: f32) -> bool {
        if cx < 0.0 || cy < 0.0 {
            return false;
        }
        let color = self.stroke_color();
        let tolerance = self.tool.fill_tolerance;
        let layer = &mut self.state.layers[layer_index];
        let filled = tools::flood_fill(
            &mut layer.pixels,
            &mut self.state.dirty,
            cx as u32,
            cy as u32,
            color,
            tolerance,
        );
        if filled == 0 {
            return false;
        }
        layer.mark_content_changed();
        self.force_recomposite();
        self.history.push(HistoryEntry::capture(&self.state, "Fill"));
        self.after_edit(layer_index);
        true
    }

    /// Completed-edit bookkeeping: persistence callback + UI notification.
    fn after_edit(&mut self, layer_index: usize) {
        let Some(layer) = self.state.layers.get(layer_index) else {
            return;
        };
        let id = layer.id;
        if let Some(callback) = self.edit_callback.as_mut()
            && let Err(e) = callback(id, &layer.pixels)
        {
            crate::log_warn!("edit persistence callback failed for layer {}: {}", id, e);
        }
        self.events.push_back(DocumentEvent::ContentChanged { id });
    }

    // -- transform session --------------------------------------------------

    /// Begin a transform on the active layer.  Refused while another session
    /// is active or when the layer is missing/hidden.
    pub fn transform_begin(&mut self) -> bool {
        if self.session.is_some() || self.stroke.is_some() {
            return false;
        }
        let Some(layer) = self.state.active_layer_mut() else {
            return false;
        };
        match TransformSession::begin(layer) {
            Some(session) => {
                self.session = Some(session);
                true
            }
            None => false,
        }
    }

    pub fn transform_apply(&mut self, delta: &TransformDelta) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let Some(index) = self.state.layer_index_by_id(session.layer_id) else {
            return false;
        };
        let applied = session.apply_delta(&mut self.state.layers[index], delta);
        if applied {
            self.state.mark_dirty(None);
            self.scheduler.schedule();
        }
        applied
    }

    /// Commit the session, baking the preview into pixels.  A click without
    /// a drag leaves the document untouched and records no history.
    pub fn transform_commit(&mut self) -> CommitOutcome {
        let Some(session) = self.session.take() else {
            return CommitOutcome::NoChange;
        };
        let Some(index) = self.state.layer_index_by_id(session.layer_id) else {
            return CommitOutcome::NoChange;
        };

        let outcome = session.commit(&mut self.state.layers[index], self.sampling);
        match outcome {
            CommitOutcome::Committed => {
                self.state.mark_dirty(None);
                self.force_recomposite();
                self.history.push(HistoryEntry::capture(&self.state, "Transform"));
                self.after_edit(index);
            }
            CommitOutcome::RolledBack => {
                self.state.mark_dirty(None);
                self.force_recomposite();
            }
            CommitOutcome::NoChange => {}
        }
        outcome
    }

    /// Cancel the session, restoring the exact pre-begin state.  Always
    /// succeeds; no history entry is recorded.
    pub fn transform_cancel(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };
        let Some(index) = self.state.layer_index_by_id(session.layer_id) else {
            return false;
        };
        session.cancel(&mut self.state.layers[index]);
        self.state.mark_dirty(None);
        self.force_recomposite();
        true
    }

    // -- undo / redo --------------------------------------------------------

    pub fn undo(&mut self) -> bool {
        // An open session would alias the restored layers; drop it first.
        if self.session.is_some() {
            self.transform_cancel();
        }
        let Some(entry) = self.history.undo() else {
            return false;
        };
        entry.restore_into(&mut self.state);
        self.finish_history_restore();
        true
    }

    pub fn redo(&mut self) -> bool {
        if self.session.is_some() {
            self.transform_cancel();
        }
        let Some(entry) = self.history.redo() else {
            return false;
        };
        entry.restore_into(&mut self.state);
        self.finish_history_restore();
        true
    }

    fn finish_history_restore(&mut self) {
        self.stroke = None;
        self.force_recomposite();
        let ids: Vec<Uuid> = self.state.layers.iter().map(|l| l.id).collect();
        for id in ids {
            self.events.push_back(DocumentEvent::ContentChanged { id });
        }
        self.events.push_back(DocumentEvent::ActiveLayerChanged {
            index: self.state.active_layer_index,
        });
    }

    // -- layer structure ----------------------------------------------------

    /// Insert a new transparent layer directly above the active one and make
    /// it active.
    pub fn add_layer(&mut self, name: &str) -> Uuid {
        let layer = Layer::new(
            name.to_string(),
            self.state.width,
            self.state.height,
            Rgba([0, 0, 0, 0]),
        );
        let id = layer.id;
        let index = (self.state.active_layer_index + 1).min(self.state.layers.len());
        self.state.layers.insert(index, layer);
        self.state.active_layer_index = index;

        self.history.push(HistoryEntry::capture(&self.state, "Add Layer"));
        self.events.push_back(DocumentEvent::LayerAdded { id, index });
        self.events.push_back(DocumentEvent::ActiveLayerChanged { index });
        id
    }

    /// Delete a layer.  The background layer is refused.
    pub fn remove_layer(&mut self, id: Uuid) -> bool {
        let Some(index) = self.state.layer_index_by_id(id) else {
            return false;
        };
        if self.state.layers[index].is_background {
            return false;
        }
        if let Some(session) = &self.session
            && session.layer_id == id
        {
            self.transform_cancel();
        }

        self.state.layers.remove(index);
        if self.state.active_layer_index >= self.state.layers.len() {
            self.state.active_layer_index = self.state.layers.len() - 1;
        }

        self.state.mark_dirty(None);
        self.force_recomposite();
        self.history.push(HistoryEntry::capture(&self.state, "Delete Layer"));
        self.events.push_back(DocumentEvent::LayerRemoved { id, index });
        self.events.push_back(DocumentEvent::ActiveLayerChanged {
            index: self.state.active_layer_index,
        });
        true
    }

    /// Duplicate a layer directly above itself.
    pub fn duplicate_layer(&mut self, id: Uuid) -> Option<Uuid> {
        let index = self.state.layer_index_by_id(id)?;
        let copy = self.state.layers[index].duplicate();
        let new_id = copy.id;
        let new_index = index + 1;
        self.state.layers.insert(new_index, copy);
        self.state.active_layer_index = new_index;

        self.state.mark_dirty(None);
        self.scheduler.schedule();
        self.history.push(HistoryEntry::capture(&self.state, "Duplicate Layer"));
        self.events.push_back(DocumentEvent::LayerAdded {
            id: new_id,
            index: new_index,
        });
        self.events.push_back(DocumentEvent::ActiveLayerChanged { index: new_index });
        Some(new_id)
    }

    /// Reorder a layer.  The background is pinned to the bottom and nothing
    /// may move below it.
    pub fn move_layer(&mut self, id: Uuid, direction: MoveDirection) -> bool {
        let Some(from) = self.state.layer_index_by_id(id) else {
            return false;
        };
        if self.state.layers[from].is_background {
            return false;
        }
        let top = self.state.layers.len() - 1;
        let to = match direction {
            MoveDirection::Up => (from + 1).min(top),
            MoveDirection::Down => from.saturating_sub(1).max(1),
            MoveDirection::Top => top,
            MoveDirection::Bottom => 1,
        };
        if to == from {
            return false;
        }

        let active_id = self.state.layers[self.state.active_layer_index].id;
        let layer = self.state.layers.remove(from);
        self.state.layers.insert(to, layer);
        if let Some(active) = self.state.layer_index_by_id(active_id) {
            self.state.active_layer_index = active;
        }

        self.state.mark_dirty(None);
        self.scheduler.schedule();
        self.history.push(HistoryEntry::capture(&self.state, "Move Layer"));
        self.events.push_back(DocumentEvent::LayerMoved { id, from, to });
        true
    }

    pub fn rename_layer(&mut self, id: Uuid, name: &str) -> bool {
        let Some(index) = self.state.layer_index_by_id(id) else {
            return false;
        };
        if self.state.layers[index].name == name {
            return false;
        }
        self.state.layers[index].name = name.to_string();
        self.history.push(HistoryEntry::capture(&self.state, "Rename Layer"));
        self.events.push_back(DocumentEvent::LayerRenamed { id });
        true
    }

    pub fn set_layer_visible(&mut self, id: Uuid, visible: bool) -> bool {
        let Some(index) = self.state.layer_index_by_id(id) else {
            return false;
        };
        if self.state.layers[index].visible == visible {
            return false;
        }
        self.state.layers[index].visible = visible;
        self.state.mark_dirty(None);
        self.scheduler.schedule();
        self.history.push(HistoryEntry::capture(&self.state, "Toggle Visibility"));
        self.events
            .push_back(DocumentEvent::VisibilityChanged { id, visible });
        true
    }

    pub fn set_layer_opacity(&mut self, id: Uuid, opacity: f32) -> bool {
        let Some(index) = self.state.layer_index_by_id(id) else {
            return false;
        };
        let opacity = opacity.clamp(0.0, 1.0);
        self.state.layers[index].opacity = opacity;
        self.state.mark_dirty(None);
        self.scheduler.schedule();
        self.history.push(HistoryEntry::capture(&self.state, "Layer Opacity"));
        self.events
            .push_back(DocumentEvent::OpacityChanged { id, opacity });
        true
    }

    pub fn set_layer_blend_mode(&mut self, id: Uuid, blend_mode: BlendMode) -> bool {
        let Some(index) = self.state.layer_index_by_id(id) else {
            return false;
        };
        if self.state.layers[index].blend_mode == blend_mode {
            return false;
        }
        self.state.layers[index].blend_mode = blend_mode;
        self.state.mark_dirty(None);
        self.scheduler.schedule();
        self.history.push(HistoryEntry::capture(&self.state, "Layer Blend Mode"));
        self.events
            .push_back(DocumentEvent::BlendModeChanged { id, blend_mode });
        true
    }

    pub fn set_active_layer(&mut self, index: usize) -> bool {
        if index >= self.state.layers.len() || index == self.state.active_layer_index {
            return false;
        }
        self.state.active_layer_index = index;
        self.events.push_back(DocumentEvent::ActiveLayerChanged { index });
        true
    }
}
