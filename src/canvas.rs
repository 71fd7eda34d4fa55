use image::{Rgba, RgbaImage};
use rayon::prelude::*;
use uuid::Uuid;

use crate::matrix::AffineMatrix;

/// Anti-aliasing margin (pixels) added around every brush mutation when
/// extending the dirty rect.
pub const AA_MARGIN: i32 = 2;

// ============================================================================
// PIXEL BUFFER — owned W×H RGBA8 raster, row-major, straight alpha
// ============================================================================

/// The unit of storage for a [`Layer`]: a flat `width * height * 4` byte
/// array.  Cloned (deep copy) whenever snapshotted into history or a
/// transform backup.
#[derive(Clone, PartialEq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Create an empty (fully transparent) buffer.
    pub fn new(width: u32, height: u32) -> Self {
        // Sanity: clamp dimensions to prevent overflow (max ~256 megapixels)
        let (width, height) = {
            let total = (width as u64) * (height as u64);
            if total > 256_000_000 || width == 0 || height == 0 {
                crate::log_warn!(
                    "PixelBuffer::new: dimensions {}×{} out of range, clamped to 1×1",
                    width,
                    height
                );
                (1, 1)
            } else {
                (width, height)
            }
        };
        Self {
            width,
            height,
            data: vec![0; (width as usize) * (height as usize) * 4],
        }
    }

    /// Fill the entire buffer with `color`.  A fully transparent fill costs
    /// nothing beyond the zeroed allocation.
    pub fn new_filled(width: u32, height: u32, color: Rgba<u8>) -> Self {
        let mut buf = Self::new(width, height);
        if color[3] > 0 {
            buf.fill(color);
        }
        buf
    }

    /// Import from a flat RGBA byte slice.  `data` must be exactly
    /// `width * height * 4` bytes (row-major, RGBA), else `None`.
    pub fn from_raw_rgba(width: u32, height: u32, data: &[u8]) -> Option<Self> {
        if data.len() != (width as usize) * (height as usize) * 4 || width == 0 || height == 0 {
            return None;
        }
        Some(Self {
            width,
            height,
            data: data.to_vec(),
        })
    }

    pub fn from_rgba_image(src: &RgbaImage) -> Self {
        Self {
            width: src.width(),
            height: src.height(),
            data: src.as_raw().clone(),
        }
    }

    pub fn to_rgba_image(&self) -> RgbaImage {
        RgbaImage::from_raw(self.width, self.height, self.data.clone())
            .expect("buffer length matches dimensions")
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel at (x, y); out-of-bounds reads return transparent.
    #[inline]
    pub fn get_pixel(&self, x: u32, y: u32) -> Rgba<u8> {
        if x >= self.width || y >= self.height {
            return Rgba([0, 0, 0, 0]);
        }
        let o = ((y * self.width + x) as usize) * 4;
        Rgba([self.data[o], self.data[o + 1], self.data[o + 2], self.data[o + 3]])
    }

    /// Write a pixel; out-of-bounds writes are ignored.
    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Rgba<u8>) {
        if x >= self.width || y >= self.height {
            return;
        }
        let o = ((y * self.width + x) as usize) * 4;
        self.data[o..o + 4].copy_from_slice(&pixel.0);
    }

    pub fn fill(&mut self, color: Rgba<u8>) {
        for px in self.data.chunks_exact_mut(4) {
            px.copy_from_slice(&color.0);
        }
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    pub fn as_raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn memory_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn is_fully_transparent(&self) -> bool {
        self.data.chunks_exact(4).all(|px| px[3] == 0)
    }

    /// Nearest-neighbour sample; outside the buffer is transparent.
    #[inline]
    pub fn sample_nearest(&self, x: f32, y: f32) -> Rgba<u8> {
        let xi = x.round() as i64;
        let yi = y.round() as i64;
        if xi < 0 || yi < 0 || xi >= self.width as i64 || yi >= self.height as i64 {
            return Rgba([0, 0, 0, 0]);
        }
        self.get_pixel(xi as u32, yi as u32)
    }

    /// Bilinear 4-tap sample against a transparent border.
    pub fn sample_bilinear(&self, x: f32, y: f32) -> Rgba<u8> {
        let x0 = x.floor() as i64;
        let y0 = y.floor() as i64;
        if x0 < -1 || y0 < -1 || x0 >= self.width as i64 || y0 >= self.height as i64 {
            return Rgba([0, 0, 0, 0]);
        }
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let sample = |sx: i64, sy: i64| -> [f32; 4] {
            if sx < 0 || sy < 0 || sx >= self.width as i64 || sy >= self.height as i64 {
                [0.0; 4]
            } else {
                let o = ((sy as u32 * self.width + sx as u32) as usize) * 4;
                [
                    self.data[o] as f32,
                    self.data[o + 1] as f32,
                    self.data[o + 2] as f32,
                    self.data[o + 3] as f32,
                ]
            }
        };

        let tl = sample(x0, y0);
        let tr = sample(x0 + 1, y0);
        let bl = sample(x0, y0 + 1);
        let br = sample(x0 + 1, y0 + 1);

        let mut out = [0u8; 4];
        for c in 0..4 {
            let top = tl[c] + (tr[c] - tl[c]) * fx;
            let bot = bl[c] + (br[c] - bl[c]) * fx;
            out[c] = (top + (bot - top) * fy).round().clamp(0.0, 255.0) as u8;
        }
        Rgba(out)
    }
}

// ============================================================================
// DIRTY RECT — minimal bounding region touched since the last flush
// ============================================================================

/// Canvas-space pixel bounds, inclusive.  The empty state is represented by
/// `min_x > max_x`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirtyRect {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl DirtyRect {
    pub const fn empty() -> Self {
        Self {
            min_x: 0,
            min_y: 0,
            max_x: -1,
            max_y: -1,
        }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self {
            min_x: 0,
            min_y: 0,
            max_x: width as i32 - 1,
            max_y: height as i32 - 1,
        }
    }

    /// Bounding box of a stamped circle, padded by the anti-aliasing margin.
    pub fn around_circle(cx: f32, cy: f32, radius: f32) -> Self {
        let r = radius.max(0.0);
        Self {
            min_x: (cx - r).floor() as i32 - AA_MARGIN,
            min_y: (cy - r).floor() as i32 - AA_MARGIN,
            max_x: (cx + r).ceil() as i32 + AA_MARGIN,
            max_y: (cy + r).ceil() as i32 + AA_MARGIN,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    pub fn include_point(&mut self, x: i32, y: i32) {
        if self.is_empty() {
            *self = Self {
                min_x: x,
                min_y: y,
                max_x: x,
                max_y: y,
            };
        } else {
            self.min_x = self.min_x.min(x);
            self.min_y = self.min_y.min(y);
            self.max_x = self.max_x.max(x);
            self.max_y = self.max_y.max(y);
        }
    }

    /// Merge with another rect so pending updates are never lost.
    pub fn union(&self, other: &DirtyRect) -> DirtyRect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        DirtyRect {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn padded(&self, margin: i32) -> DirtyRect {
        if self.is_empty() {
            return *self;
        }
        DirtyRect {
            min_x: self.min_x - margin,
            min_y: self.min_y - margin,
            max_x: self.max_x + margin,
            max_y: self.max_y + margin,
        }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        !self.is_empty() && x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Clamp to canvas bounds.  `None` when empty or entirely outside.
    pub fn clamped(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if self.is_empty() {
            return None;
        }
        let x0 = self.min_x.max(0);
        let y0 = self.min_y.max(0);
        let x1 = self.max_x.min(width as i32 - 1);
        let y1 = self.max_y.min(height as i32 - 1);
        if x0 > x1 || y0 > y1 {
            return None;
        }
        Some((x0 as u32, y0 as u32, x1 as u32, y1 as u32))
    }
}

/// Accumulates the minimal bounding rectangle touched since the last flush,
/// plus a generation counter bumped on every extension so external caches
/// can detect staleness.
#[derive(Clone, Debug)]
pub struct DirtyTracker {
    rect: DirtyRect,
    generation: u64,
}

impl Default for DirtyTracker {
    fn default() -> Self {
        Self {
            rect: DirtyRect::empty(),
            generation: 0,
        }
    }
}

impl DirtyTracker {
    pub fn extend(&mut self, rect: DirtyRect) {
        if rect.is_empty() {
            return;
        }
        self.rect = self.rect.union(&rect);
        self.generation = self.generation.wrapping_add(1);
    }

    /// Take the accumulated rect, resetting to empty.
    pub fn take(&mut self) -> DirtyRect {
        std::mem::replace(&mut self.rect, DirtyRect::empty())
    }

    pub fn peek(&self) -> DirtyRect {
        self.rect
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// ============================================================================
// BLEND MODES
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    ColorDodge,
    ColorBurn,
    HardLight,
    SoftLight,
    Difference,
    Exclusion,
}

impl BlendMode {
    /// Returns all blend modes for UI display
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Overlay,
            BlendMode::Darken,
            BlendMode::Lighten,
            BlendMode::ColorDodge,
            BlendMode::ColorBurn,
            BlendMode::HardLight,
            BlendMode::SoftLight,
            BlendMode::Difference,
            BlendMode::Exclusion,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "Normal",
            BlendMode::Multiply => "Multiply",
            BlendMode::Screen => "Screen",
            BlendMode::Overlay => "Overlay",
            BlendMode::Darken => "Darken",
            BlendMode::Lighten => "Lighten",
            BlendMode::ColorDodge => "Color Dodge",
            BlendMode::ColorBurn => "Color Burn",
            BlendMode::HardLight => "Hard Light",
            BlendMode::SoftLight => "Soft Light",
            BlendMode::Difference => "Difference",
            BlendMode::Exclusion => "Exclusion",
        }
    }

    /// Convert to a stable u8 for binary serialization
    pub fn to_u8(&self) -> u8 {
        match self {
            BlendMode::Normal => 0,
            BlendMode::Multiply => 1,
            BlendMode::Screen => 2,
            BlendMode::Overlay => 3,
            BlendMode::Darken => 4,
            BlendMode::Lighten => 5,
            BlendMode::ColorDodge => 6,
            BlendMode::ColorBurn => 7,
            BlendMode::HardLight => 8,
            BlendMode::SoftLight => 9,
            BlendMode::Difference => 10,
            BlendMode::Exclusion => 11,
        }
    }

    /// Reconstruct from a u8 (defaults to Normal for unknown values)
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => BlendMode::Normal,
            1 => BlendMode::Multiply,
            2 => BlendMode::Screen,
            3 => BlendMode::Overlay,
            4 => BlendMode::Darken,
            5 => BlendMode::Lighten,
            6 => BlendMode::ColorDodge,
            7 => BlendMode::ColorBurn,
            8 => BlendMode::HardLight,
            9 => BlendMode::SoftLight,
            10 => BlendMode::Difference,
            11 => BlendMode::Exclusion,
            _ => BlendMode::Normal,
        }
    }
}

/// Blend `top` over `base` with the given mode and layer opacity.
/// Straight (non-premultiplied) alpha throughout.
pub fn blend_pixel(base: Rgba<u8>, top: Rgba<u8>, mode: BlendMode, opacity: f32) -> Rgba<u8> {
    // Fast path: fully transparent top pixel — nothing to blend
    if top[3] == 0 {
        return base;
    }

    // Fast path: Normal blend, full opacity, fully opaque top pixel — just overwrite
    if matches!(mode, BlendMode::Normal) && opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let opacity = opacity.clamp(0.0, 1.0);

    let base_r = base[0] as f32 / 255.0;
    let base_g = base[1] as f32 / 255.0;
    let base_b = base[2] as f32 / 255.0;
    let base_a = base[3] as f32 / 255.0;

    let top_r = top[0] as f32 / 255.0;
    let top_g = top[1] as f32 / 255.0;
    let top_b = top[2] as f32 / 255.0;
    let top_a = (top[3] as f32 / 255.0) * opacity;

    let (r, g, b) = match mode {
        BlendMode::Normal => (top_r, top_g, top_b),
        BlendMode::Multiply => (base_r * top_r, base_g * top_g, base_b * top_b),
        BlendMode::Screen => (
            1.0 - (1.0 - base_r) * (1.0 - top_r),
            1.0 - (1.0 - base_g) * (1.0 - top_g),
            1.0 - (1.0 - base_b) * (1.0 - top_b),
        ),
        BlendMode::Overlay => (
            overlay_channel(base_r, top_r),
            overlay_channel(base_g, top_g),
            overlay_channel(base_b, top_b),
        ),
        BlendMode::Darken => (base_r.min(top_r), base_g.min(top_g), base_b.min(top_b)),
        BlendMode::Lighten => (base_r.max(top_r), base_g.max(top_g), base_b.max(top_b)),
        BlendMode::ColorDodge => (
            color_dodge_channel(base_r, top_r),
            color_dodge_channel(base_g, top_g),
            color_dodge_channel(base_b, top_b),
        ),
        BlendMode::ColorBurn => (
            color_burn_channel(base_r, top_r),
            color_burn_channel(base_g, top_g),
            color_burn_channel(base_b, top_b),
        ),
        BlendMode::HardLight => (
            overlay_channel(top_r, base_r),
            overlay_channel(top_g, base_g),
            overlay_channel(top_b, base_b),
        ),
        BlendMode::SoftLight => (
            soft_light_channel(base_r, top_r),
            soft_light_channel(base_g, top_g),
            soft_light_channel(base_b, top_b),
        ),
        BlendMode::Difference => (
            (base_r - top_r).abs(),
            (base_g - top_g).abs(),
            (base_b - top_b).abs(),
        ),
        BlendMode::Exclusion => (
            base_r + top_r - 2.0 * base_r * top_r,
            base_g + top_g - 2.0 * base_g * top_g,
            base_b + top_b - 2.0 * base_b * top_b,
        ),
    };

    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a == 0.0 {
        return Rgba([0, 0, 0, 0]);
    }

    let out_r = (r * top_a + base_r * base_a * (1.0 - top_a)) / out_a;
    let out_g = (g * top_a + base_g * base_a * (1.0 - top_a)) / out_a;
    let out_b = (b * top_a + base_b * base_a * (1.0 - top_a)) / out_a;

    Rgba([
        (out_r * 255.0).clamp(0.0, 255.0) as u8,
        (out_g * 255.0).clamp(0.0, 255.0) as u8,
        (out_b * 255.0).clamp(0.0, 255.0) as u8,
        (out_a * 255.0).clamp(0.0, 255.0) as u8,
    ])
}

// Blend mode helper functions
fn overlay_channel(base: f32, top: f32) -> f32 {
    if base < 0.5 {
        2.0 * base * top
    } else {
        1.0 - 2.0 * (1.0 - base) * (1.0 - top)
    }
}

fn color_burn_channel(base: f32, top: f32) -> f32 {
    if top == 0.0 {
        0.0
    } else {
        (1.0 - (1.0 - base) / top).max(0.0)
    }
}

fn color_dodge_channel(base: f32, top: f32) -> f32 {
    if top >= 1.0 {
        1.0
    } else {
        (base / (1.0 - top)).min(1.0)
    }
}

/// W3C Soft Light formula.
fn soft_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base - (1.0 - 2.0 * top) * base * (1.0 - base)
    } else {
        let d = if base <= 0.25 {
            ((16.0 * base - 12.0) * base + 4.0) * base
        } else {
            base.sqrt()
        };
        base + (2.0 * top - 1.0) * (d - base)
    }
}

// ============================================================================
// LAYER
// ============================================================================

pub struct Layer {
    pub id: Uuid,
    pub name: String,
    pub visible: bool,
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub pixels: PixelBuffer,
    /// Per-layer content transform.  Identity except while a transform
    /// session is previewing; commit always resets it.
    pub matrix: AffineMatrix,
    /// The bottom layer of every document; cannot be deleted or reordered.
    pub is_background: bool,
    /// Per-layer generation counter for external GPU texture caches.
    /// Bumped only when THIS layer's pixels are modified, so unchanged
    /// layers are never re-uploaded.
    pub gpu_generation: u64,
}

impl Layer {
    pub fn new(name: String, width: u32, height: u32, fill_color: Rgba<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            visible: true,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            pixels: PixelBuffer::new_filled(width, height, fill_color),
            matrix: AffineMatrix::identity(),
            is_background: false,
            gpu_generation: 0,
        }
    }

    /// Call after any pixel modification.
    pub fn mark_content_changed(&mut self) {
        self.gpu_generation = self.gpu_generation.wrapping_add(1);
    }

    /// Deep copy with a fresh id.
    pub fn duplicate(&self) -> Layer {
        Layer {
            id: Uuid::new_v4(),
            name: format!("{} copy", self.name),
            visible: self.visible,
            opacity: self.opacity,
            blend_mode: self.blend_mode,
            pixels: self.pixels.clone(),
            matrix: self.matrix,
            is_background: false,
            gpu_generation: 0,
        }
    }
}

// ============================================================================
// CANVAS STATE + COMPOSITOR
// ============================================================================

/// Sampling used when a layer's matrix maps its pixels into canvas space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Sampling {
    Nearest,
    #[default]
    Bilinear,
}

/// Per-layer access plan resolved once per composite call.
enum LayerSource<'a> {
    /// Identity matrix, canvas-sized buffer — direct row reads.
    Direct(&'a [u8]),
    /// Sample through the inverted layer matrix.
    Mapped(AffineMatrix, &'a PixelBuffer),
}

pub struct CanvasState {
    /// Back-to-front compositing order; index 0 is the background.
    pub layers: Vec<Layer>,
    pub active_layer_index: usize,
    pub width: u32,
    pub height: u32,
    pub dirty: DirtyTracker,
}

impl CanvasState {
    pub fn new(width: u32, height: u32) -> Self {
        let white = Rgba([255, 255, 255, 255]);
        let mut background = Layer::new("Background".to_string(), width, height, white);
        background.is_background = true;

        Self {
            layers: vec![background],
            active_layer_index: 0,
            width,
            height,
            dirty: DirtyTracker::default(),
        }
    }

    pub fn active_layer(&self) -> Option<&Layer> {
        self.layers.get(self.active_layer_index)
    }

    pub fn active_layer_mut(&mut self) -> Option<&mut Layer> {
        self.layers.get_mut(self.active_layer_index)
    }

    pub fn layer_index_by_id(&self, id: Uuid) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    /// Extend the dirty rect; `None` marks the whole canvas.
    pub fn mark_dirty(&mut self, rect: Option<DirtyRect>) {
        let full = DirtyRect::full(self.width, self.height);
        self.dirty.extend(rect.unwrap_or(full));
    }

    /// Composite every visible layer, back-to-front, into `dest`, restricted
    /// to `region`.  Pixels strictly outside `region` are left bit-for-bit
    /// unchanged.  `dest` must be canvas-sized.
    ///
    /// Layers with a non-identity matrix are sampled through its inverse;
    /// a layer whose matrix cannot be inverted contributes nothing.
    pub fn composite_region(&self, region: DirtyRect, dest: &mut PixelBuffer, sampling: Sampling) {
        debug_assert_eq!((dest.width(), dest.height()), (self.width, self.height));
        let Some((x0, y0, x1, y1)) = region.clamped(self.width, self.height) else {
            return;
        };

        let sources: Vec<(LayerSource<'_>, BlendMode, f32)> = self
            .layers
            .iter()
            .filter(|layer| layer.visible)
            .filter_map(|layer| {
                let canvas_sized = layer.pixels.width() == self.width
                    && layer.pixels.height() == self.height;
                let source = if layer.matrix.is_identity() && canvas_sized {
                    LayerSource::Direct(layer.pixels.as_raw())
                } else {
                    LayerSource::Mapped(layer.matrix.invert()?, &layer.pixels)
                };
                Some((source, layer.blend_mode, layer.opacity))
            })
            .collect();

        let w = self.width as usize;
        let row_bytes = w * 4;

        dest.as_raw_mut()
            .par_chunks_mut(row_bytes)
            .enumerate()
            .filter(|(y, _)| *y >= y0 as usize && *y <= y1 as usize)
            .for_each(|(y, row)| {
                for x in (x0 as usize)..=(x1 as usize) {
                    let mut base = Rgba([0, 0, 0, 0]);
                    for (source, mode, opacity) in &sources {
                        let top = match source {
                            LayerSource::Direct(raw) => {
                                let o = (y * w + x) * 4;
                                Rgba([raw[o], raw[o + 1], raw[o + 2], raw[o + 3]])
                            }
                            LayerSource::Mapped(inv, buf) => {
                                let (lx, ly) = inv.transform_point(x as f32, y as f32);
                                match sampling {
                                    Sampling::Nearest => buf.sample_nearest(lx, ly),
                                    Sampling::Bilinear => buf.sample_bilinear(lx, ly),
                                }
                            }
                        };
                        base = blend_pixel(base, top, *mode, *opacity);
                    }
                    row[x * 4..x * 4 + 4].copy_from_slice(&base.0);
                }
            });
    }

    /// Composite everything into a fresh image (the bulk-operation fast path
    /// used after undo/redo and resize).
    pub fn composite(&self) -> RgbaImage {
        let mut dest = PixelBuffer::new(self.width, self.height);
        self.composite_region(
            DirtyRect::full(self.width, self.height),
            &mut dest,
            Sampling::Bilinear,
        );
        dest.to_rgba_image()
    }

    /// Flatten all visible layers into a single opaque image suitable for
    /// encoding to a standard raster format.  Residual transparency is
    /// composited over white.
    pub fn flatten(&self) -> RgbaImage {
        let mut img = self.composite();
        for px in img.pixels_mut() {
            let a = px[3] as f32 / 255.0;
            for c in 0..3 {
                px[c] = (px[c] as f32 * a + 255.0 * (1.0 - a)).round() as u8;
            }
            px[3] = 255;
        }
        img
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

    #[test]
    fn pixel_buffer_round_trips_raw_data() {
        let mut buf = PixelBuffer::new(4, 3);
        buf.put_pixel(2, 1, RED);
        assert_eq!(buf.get_pixel(2, 1), RED);
        assert_eq!(buf.get_pixel(0, 0), TRANSPARENT);
        // out of bounds: read transparent, write ignored
        assert_eq!(buf.get_pixel(99, 99), TRANSPARENT);
        buf.put_pixel(99, 99, RED);

        let copy = PixelBuffer::from_raw_rgba(4, 3, buf.as_raw()).unwrap();
        assert_eq!(copy.get_pixel(2, 1), RED);
        assert!(PixelBuffer::from_raw_rgba(4, 3, &[0; 7]).is_none());
    }

    #[test]
    fn dirty_rect_union_and_empty_state() {
        let empty = DirtyRect::empty();
        assert!(empty.is_empty());
        assert!(empty.min_x > empty.max_x);

        let a = DirtyRect {
            min_x: 2,
            min_y: 2,
            max_x: 4,
            max_y: 4,
        };
        assert_eq!(empty.union(&a), a);
        let b = DirtyRect {
            min_x: 10,
            min_y: 0,
            max_x: 12,
            max_y: 1,
        };
        let u = a.union(&b);
        assert_eq!((u.min_x, u.min_y, u.max_x, u.max_y), (2, 0, 12, 4));
    }

    #[test]
    fn dirty_tracker_takes_and_resets() {
        let mut tracker = DirtyTracker::default();
        assert!(tracker.peek().is_empty());
        tracker.extend(DirtyRect::around_circle(5.0, 5.0, 3.0));
        let g = tracker.generation();
        tracker.extend(DirtyRect::empty()); // no-op
        assert_eq!(tracker.generation(), g);

        let rect = tracker.take();
        assert!(!rect.is_empty());
        // circle bounds plus the ≥2px AA margin
        assert!(rect.min_x <= 0 && rect.max_x >= 10);
        assert!(tracker.peek().is_empty());
    }

    #[test]
    fn blend_mode_u8_codes_round_trip() {
        for &mode in BlendMode::all() {
            assert_eq!(BlendMode::from_u8(mode.to_u8()), mode);
        }
        assert_eq!(BlendMode::from_u8(200), BlendMode::Normal);
    }

    #[test]
    fn blend_normal_over_and_multiply() {
        let white = Rgba([255, 255, 255, 255]);
        // opaque top overwrites
        assert_eq!(blend_pixel(white, RED, BlendMode::Normal, 1.0), RED);
        // transparent top leaves base
        assert_eq!(blend_pixel(white, TRANSPARENT, BlendMode::Multiply, 1.0), white);
        // multiply darkens
        let grey = Rgba([128, 128, 128, 255]);
        let out = blend_pixel(grey, grey, BlendMode::Multiply, 1.0);
        assert!(out[0] < 128 + 2 && out[0] > 56);
        // half opacity normal over white lightens red
        let out = blend_pixel(white, RED, BlendMode::Normal, 0.5);
        assert!(out[0] == 255 && out[1] > 100);
    }

    #[test]
    fn composite_respects_visibility_and_opacity() {
        let mut state = CanvasState::new(4, 4);
        let mut top = Layer::new("Ink".into(), 4, 4, RED);
        top.opacity = 0.5;
        state.layers.push(top);

        let img = state.composite();
        let px = img.get_pixel(1, 1);
        assert_eq!(px[0], 255);
        assert!(px[1] > 100 && px[1] < 160, "half red over white: {:?}", px);

        state.layers[1].visible = false;
        let img = state.composite();
        assert_eq!(*img.get_pixel(1, 1), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn composite_region_leaves_outside_untouched() {
        let mut state = CanvasState::new(8, 8);
        let mut dest = PixelBuffer::new(8, 8);
        // sentinel everywhere
        dest.fill(Rgba([1, 2, 3, 4]));

        state.layers[0].pixels.fill(RED);
        let region = DirtyRect {
            min_x: 2,
            min_y: 2,
            max_x: 5,
            max_y: 5,
        };
        state.composite_region(region, &mut dest, Sampling::Bilinear);

        for y in 0..8u32 {
            for x in 0..8u32 {
                let px = dest.get_pixel(x, y);
                if region.contains(x as i32, y as i32) {
                    assert_eq!(px, RED, "inside at ({}, {})", x, y);
                } else {
                    assert_eq!(px, Rgba([1, 2, 3, 4]), "outside at ({}, {})", x, y);
                }
            }
        }
    }

    #[test]
    fn composite_samples_through_layer_matrix() {
        let mut state = CanvasState::new(8, 8);
        // background transparent so the moved layer is the only content
        state.layers[0].pixels.clear();
        let mut ink = Layer::new("Ink".into(), 8, 8, TRANSPARENT);
        ink.pixels.put_pixel(1, 1, RED);
        ink.matrix = crate::matrix::AffineMatrix::translation(3.0, 0.0);
        state.layers.push(ink);

        let img = state.composite();
        assert_eq!(*img.get_pixel(4, 1), RED);
        assert_eq!(img.get_pixel(1, 1)[3], 0);
    }

    #[test]
    fn singular_layer_matrix_contributes_nothing() {
        let mut state = CanvasState::new(4, 4);
        let mut ink = Layer::new("Ink".into(), 4, 4, RED);
        ink.matrix = crate::matrix::AffineMatrix::scaling(0.0, 1.0);
        state.layers.push(ink);

        let img = state.composite();
        assert_eq!(*img.get_pixel(2, 2), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn flatten_produces_opaque_pixels() {
        let mut state = CanvasState::new(4, 4);
        state.layers[0].pixels.clear(); // fully transparent document
        let img = state.flatten();
        for px in img.pixels() {
            assert_eq!(px[3], 255);
            assert_eq!(px[0], 255); // white backdrop
        }
    }
}
