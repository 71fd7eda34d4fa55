use image::Rgba;
use std::collections::VecDeque;

use crate::canvas::{DirtyRect, DirtyTracker, PixelBuffer};

// ============================================================================
// TOOLS + TOOL CONTEXT
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Tool {
    #[default]
    Pen,
    Eraser,
    Bucket,
}

impl Tool {
    pub fn all() -> &'static [Tool] {
        &[Tool::Pen, Tool::Eraser, Tool::Bucket]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Tool::Pen => "Pen",
            Tool::Eraser => "Eraser",
            Tool::Bucket => "Bucket",
        }
    }
}

/// Explicit tool parameters handed to every rasterizer call — the engine has
/// no free-floating "current color" state.
#[derive(Clone, Copy, Debug)]
pub struct ToolContext {
    pub tool: Tool,
    pub color: Rgba<u8>,
    pub base_size: f32,
    pub opacity: f32,
    /// Squared-Euclidean RGBA tolerance for the bucket tool.
    pub fill_tolerance: f32,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            tool: Tool::Pen,
            color: Rgba([0, 0, 0, 255]),
            base_size: 8.0,
            opacity: 1.0,
            fill_tolerance: 0.0,
        }
    }
}

// ============================================================================
// PRESSURE → STROKE SIZE
// ============================================================================

/// Fixed capacity of the rolling pressure history.
pub const PRESSURE_HISTORY_CAPACITY: usize = 5;

#[derive(Clone, Debug)]
pub struct PressureSettings {
    /// Lower bound of the output size as a fraction of the base size.
    pub min_size_ratio: f32,
    /// Exponent applied to the smoothed pressure; `<1` biases toward thicker
    /// strokes, `>1` toward thinner.
    pub curve_exponent: f32,
    /// Stretch the user's local pressure range (min/max of the short history)
    /// to [0, 1] before applying the curve.
    pub dynamic_range: bool,
    /// Global supersampling factor; scales the absolute size floor.
    pub supersample: f32,
}

impl Default for PressureSettings {
    fn default() -> Self {
        Self {
            min_size_ratio: 0.1,
            curve_exponent: 1.0,
            dynamic_range: false,
            supersample: 1.0,
        }
    }
}

/// Caller-owned rolling history of recent normalized pressure samples.
#[derive(Clone, Debug, Default)]
pub struct PressureHistory {
    samples: VecDeque<f32>,
}

impl PressureHistory {
    pub fn push(&mut self, sample: f32) {
        self.samples.push_back(sample.clamp(0.0, 1.0));
        while self.samples.len() > PRESSURE_HISTORY_CAPACITY {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Reset at the start of every stroke so the damping ramp replays.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    fn mean(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f32>() / self.samples.len() as f32
    }

    fn min_max(&self) -> (f32, f32) {
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for &s in &self.samples {
            min = min.min(s);
            max = max.max(s);
        }
        (min, max)
    }
}

/// Map a raw pressure sample plus the rolling history into an effective
/// stroke diameter.  Pure aside from the caller-owned history:
///
/// 1. append the sample (oldest evicted beyond capacity);
/// 2. smooth via the arithmetic mean of the history;
/// 3. damp the start of the stroke — while the history is still filling,
///    scale by `0.2 + (len/capacity)^3 * 0.8` so the first samples ramp up
///    instead of snapping to full size;
/// 4. optionally renormalize against the min/max observed in the short
///    history ("dynamic range");
/// 5. raise to the configured curve exponent;
/// 6. lerp between `min_size_ratio * base` and `base`.
///
/// The result never drops below `0.1 * base * supersample` and never
/// exceeds the base size.
pub fn effective_stroke_size(
    base_size: f32,
    raw_pressure: f32,
    history: &mut PressureHistory,
    settings: &PressureSettings,
) -> f32 {
    history.push(raw_pressure);

    let mut value = history.mean();

    let len = history.len();
    if len < PRESSURE_HISTORY_CAPACITY {
        let t = len as f32 / PRESSURE_HISTORY_CAPACITY as f32;
        value *= 0.2 + t * t * t * 0.8;
    }

    if settings.dynamic_range {
        let (min, max) = history.min_max();
        if max > min {
            value = ((value - min) / (max - min)).clamp(0.0, 1.0);
        }
    }

    value = value.clamp(0.0, 1.0).powf(settings.curve_exponent);

    let ratio = settings.min_size_ratio.clamp(0.0, 1.0);
    let size = base_size * (ratio + (1.0 - ratio) * value);

    let floor = 0.1 * base_size * settings.supersample;
    size.max(floor).min(base_size)
}

// ============================================================================
// RASTERIZER — stamps circles/lines and flood-fills a pixel buffer
// ============================================================================

/// Stamp an anti-aliased filled circle at (`cx`, `cy`).
///
/// Every pixel within `radius` of the center gets
/// `alpha = clamp(1 - max(0, dist - radius + 1), 0, 1)` — a 1px falloff
/// ring.  Pen stamps alpha-blend `color` over the buffer; eraser stamps
/// multiply the existing alpha by `1 - alpha` instead.  The dirty rect is
/// extended over the stamped bounds plus the anti-aliasing margin.
pub fn stamp_circle(
    buffer: &mut PixelBuffer,
    dirty: &mut DirtyTracker,
    cx: f32,
    cy: f32,
    radius: f32,
    color: Rgba<u8>,
    is_eraser: bool,
) {
    if radius <= 0.0 || !cx.is_finite() || !cy.is_finite() {
        return;
    }
    let w = buffer.width() as i32;
    let h = buffer.height() as i32;
    let reach = radius.ceil() as i32;
    let min_x = ((cx.floor() as i32) - reach).max(0);
    let min_y = ((cy.floor() as i32) - reach).max(0);
    let max_x = ((cx.ceil() as i32) + reach).min(w - 1);
    let max_y = ((cy.ceil() as i32) + reach).min(h - 1);
    if min_x > max_x || min_y > max_y {
        return;
    }

    let stride = buffer.width() as usize * 4;
    let raw = buffer.as_raw_mut();

    for y in min_y..=max_y {
        let dy = y as f32 - cy;
        let row = y as usize * stride;
        for x in min_x..=max_x {
            let dx = x as f32 - cx;
            let dist = (dx * dx + dy * dy).sqrt();
            if dist > radius {
                continue;
            }
            let alpha_mult = (1.0 - (dist - radius + 1.0).max(0.0)).clamp(0.0, 1.0);
            if alpha_mult <= 0.0 {
                continue;
            }
            let o = row + x as usize * 4;

            if is_eraser {
                let kept = raw[o + 3] as f32 * (1.0 - alpha_mult);
                raw[o + 3] = kept.round() as u8;
                continue;
            }

            // Fast path: opaque interior — direct overwrite
            if alpha_mult >= 1.0 && color[3] == 255 {
                raw[o] = color[0];
                raw[o + 1] = color[1];
                raw[o + 2] = color[2];
                raw[o + 3] = 255;
                continue;
            }

            // Standard "over" compositing with straight alpha
            let top_a = (color[3] as f32 / 255.0) * alpha_mult;
            let bot_a = raw[o + 3] as f32 / 255.0;
            let out_a = top_a + bot_a * (1.0 - top_a);
            if out_a <= 0.0 {
                continue;
            }
            for c in 0..3 {
                let top_c = color[c] as f32 / 255.0;
                let bot_c = raw[o + c] as f32 / 255.0;
                let out_c = (top_c * top_a + bot_c * bot_a * (1.0 - top_a)) / out_a;
                raw[o + c] = (out_c * 255.0).round().clamp(0.0, 255.0) as u8;
            }
            raw[o + 3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }

    dirty.extend(DirtyRect::around_circle(cx, cy, radius));
}

/// Stamp a line from (`x0`, `y0`) to (`x1`, `y1`) by walking a
/// Bresenham-style integer stepper, one axis per step, so consecutive
/// stamps always share an edge — no gaps at any slope or radius.
///
/// `size_at(t)` returns the stroke *diameter* at progress `t ∈ [0, 1]`,
/// letting the caller interpolate pressure along the segment.
pub fn stamp_line(
    buffer: &mut PixelBuffer,
    dirty: &mut DirtyTracker,
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
    size_at: impl Fn(f32) -> f32,
    color: Rgba<u8>,
    is_eraser: bool,
) {
    let ix0 = x0.round() as i32;
    let iy0 = y0.round() as i32;
    let ix1 = x1.round() as i32;
    let iy1 = y1.round() as i32;

    let dx = (ix1 - ix0).abs();
    let dy = (iy1 - iy0).abs();
    let sx = if ix0 < ix1 { 1 } else { -1 };
    let sy = if iy0 < iy1 { 1 } else { -1 };
    let total = (dx + dy).max(1);

    let mut x = ix0;
    let mut y = iy0;
    let mut err = dx - dy;
    let mut step = 0;

    loop {
        let t = step as f32 / total as f32;
        stamp_circle(
            buffer,
            dirty,
            x as f32,
            y as f32,
            size_at(t) / 2.0,
            color,
            is_eraser,
        );
        if x == ix1 && y == iy1 {
            break;
        }
        // One axis per step keeps the walk 4-connected.
        if x == ix1 {
            y += sy;
        } else if y == iy1 {
            x += sx;
        } else if 2 * err > -dy {
            err -= dy;
            x += sx;
        } else {
            err += dx;
            y += sy;
        }
        step += 1;
    }
}

/// 4-connected stack-based flood fill.
///
/// A candidate matches the seed iff the squared Euclidean distance across
/// R, G, B, A is ≤ `tolerance²`.  Filling is a no-op when the seed pixel
/// already equals the fill color (prevents self-fill loops).  Returns the
/// number of pixels filled; the dirty rect is extended over the filled
/// bounds plus a 1px margin.
pub fn flood_fill(
    buffer: &mut PixelBuffer,
    dirty: &mut DirtyTracker,
    start_x: u32,
    start_y: u32,
    fill: Rgba<u8>,
    tolerance: f32,
) -> usize {
    let w = buffer.width();
    let h = buffer.height();
    if start_x >= w || start_y >= h {
        return 0;
    }

    let seed = buffer.get_pixel(start_x, start_y);
    if seed == fill {
        return 0;
    }

    let tol_sq = tolerance * tolerance;
    let similar = |px: Rgba<u8>| -> bool {
        let dr = px[0] as f32 - seed[0] as f32;
        let dg = px[1] as f32 - seed[1] as f32;
        let db = px[2] as f32 - seed[2] as f32;
        let da = px[3] as f32 - seed[3] as f32;
        dr * dr + dg * dg + db * db + da * da <= tol_sq
    };

    let wu = w as usize;
    // Explicit visited set keyed by flat index — no revisits, no cycles.
    let mut visited = vec![false; wu * h as usize];

    let seed_idx = start_y as usize * wu + start_x as usize;
    let mut stack: Vec<u32> = Vec::with_capacity(1024);
    visited[seed_idx] = true;
    stack.push(seed_idx as u32);

    let mut bounds = DirtyRect::empty();
    let mut filled = 0usize;

    while let Some(idx) = stack.pop() {
        let x = (idx as usize % wu) as u32;
        let y = (idx as usize / wu) as u32;

        buffer.put_pixel(x, y, fill);
        filled += 1;
        bounds.include_point(x as i32, y as i32);

        let neighbors = [
            (x.wrapping_sub(1), y),
            (x + 1, y),
            (x, y.wrapping_sub(1)),
            (x, y + 1),
        ];
        for (nx, ny) in neighbors {
            if nx >= w || ny >= h {
                continue;
            }
            let ni = ny as usize * wu + nx as usize;
            if visited[ni] {
                continue;
            }
            visited[ni] = true;
            if similar(buffer.get_pixel(nx, ny)) {
                stack.push(ni as u32);
            }
        }
    }

    dirty.extend(bounds.padded(1));
    filled
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);
    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

    #[test]
    fn stroke_size_stays_within_floor_and_base() {
        let settings = PressureSettings::default();
        for raw in [-1.0, 0.0, 0.1, 0.5, 0.77, 1.0, 2.0] {
            let mut history = PressureHistory::default();
            for _ in 0..10 {
                let size = effective_stroke_size(20.0, raw, &mut history, &settings);
                assert!(size >= 0.1 * 20.0 - 1e-5, "raw {} gave {}", raw, size);
                assert!(size <= 20.0 + 1e-5, "raw {} gave {}", raw, size);
            }
        }
    }

    #[test]
    fn stroke_start_ramps_up_under_constant_pressure() {
        let settings = PressureSettings::default();
        let mut history = PressureHistory::default();
        let mut last = 0.0;
        for _ in 0..PRESSURE_HISTORY_CAPACITY {
            let size = effective_stroke_size(10.0, 1.0, &mut history, &settings);
            assert!(size >= last, "damping ramp must be non-decreasing");
            last = size;
        }
        // full history at max pressure reaches the base size
        assert!((last - 10.0).abs() < 1e-4);
    }

    #[test]
    fn dynamic_range_stretches_local_pressure_window() {
        let settings = PressureSettings {
            dynamic_range: true,
            ..Default::default()
        };
        let mut history = PressureHistory::default();
        // saturate the window with a narrow band of pressures
        for raw in [0.4, 0.41, 0.42, 0.43, 0.44, 0.6] {
            effective_stroke_size(10.0, raw, &mut history, &settings);
        }
        // the mean sits inside the observed window, so renormalization keeps
        // the output strictly between the floor and the base size
        let size = effective_stroke_size(10.0, 0.5, &mut history, &settings);
        assert!(size > 1.0 && size < 10.0);
    }

    #[test]
    fn stamp_circle_scenario() {
        // 10×10 transparent layer, opaque red circle radius 3 at the center
        let mut buf = PixelBuffer::new(10, 10);
        let mut dirty = DirtyTracker::default();
        stamp_circle(&mut buf, &mut dirty, 5.0, 5.0, 3.0, RED, false);

        assert_eq!(buf.get_pixel(5, 5), RED);
        assert_eq!(buf.get_pixel(0, 0)[3], 0);

        let rect = dirty.peek();
        assert!(rect.contains(5, 5));
        // stamped bounds plus the AA margin
        assert!(rect.min_x <= 0 && rect.max_x >= 10);
    }

    #[test]
    fn eraser_multiplies_existing_alpha_down() {
        let mut buf = PixelBuffer::new(6, 6);
        buf.fill(RED);
        let mut dirty = DirtyTracker::default();
        stamp_circle(&mut buf, &mut dirty, 3.0, 3.0, 2.0, RED, true);
        assert_eq!(buf.get_pixel(3, 3)[3], 0, "eraser core clears alpha");
        assert_eq!(buf.get_pixel(0, 0)[3], 255, "outside untouched");
    }

    #[test]
    fn stamp_line_leaves_no_gaps_on_steep_slopes() {
        let mut buf = PixelBuffer::new(16, 16);
        let mut dirty = DirtyTracker::default();
        stamp_line(&mut buf, &mut dirty, 2.0, 1.0, 4.0, 14.0, |_| 2.0, RED, false);

        // every row between the endpoints must contain painted pixels
        for y in 1..=14u32 {
            let any = (0..16u32).any(|x| buf.get_pixel(x, y)[3] > 0);
            assert!(any, "gap at row {}", y);
        }
    }

    #[test]
    fn stamp_line_interpolates_size_along_segment() {
        let mut buf = PixelBuffer::new(32, 8);
        let mut dirty = DirtyTracker::default();
        stamp_line(
            &mut buf,
            &mut dirty,
            2.0,
            4.0,
            29.0,
            4.0,
            |t| 1.0 + t * 6.0,
            RED,
            false,
        );
        // thin end: nothing 3px above the baseline; thick end: painted
        assert_eq!(buf.get_pixel(2, 1)[3], 0);
        assert!(buf.get_pixel(29, 1)[3] > 0);
    }

    #[test]
    fn flood_fill_fills_uniform_buffer() {
        // all-white 4×4, tolerance 0, blue from the corner → all 16 blue
        let mut buf = PixelBuffer::new(4, 4);
        buf.fill(WHITE);
        let mut dirty = DirtyTracker::default();
        let filled = flood_fill(&mut buf, &mut dirty, 0, 0, BLUE, 0.0);
        assert_eq!(filled, 16);
        for y in 0..4 {
            for x in 0..4 {
                assert_eq!(buf.get_pixel(x, y), BLUE);
            }
        }
    }

    #[test]
    fn flood_fill_visits_enclosed_region_exactly_once() {
        // 8×8 white buffer with a red frame enclosing a 4×4 interior
        let mut buf = PixelBuffer::new(8, 8);
        buf.fill(WHITE);
        for i in 1..7u32 {
            buf.put_pixel(i, 1, RED);
            buf.put_pixel(i, 6, RED);
            buf.put_pixel(1, i, RED);
            buf.put_pixel(6, i, RED);
        }
        let mut dirty = DirtyTracker::default();
        let filled = flood_fill(&mut buf, &mut dirty, 3, 3, BLUE, 0.0);
        assert_eq!(filled, 16, "exactly the 4×4 interior");
        assert_eq!(buf.get_pixel(0, 0), WHITE, "outside the frame untouched");
        assert_eq!(buf.get_pixel(1, 1), RED, "frame untouched");
    }

    #[test]
    fn flood_fill_seed_match_is_a_no_op() {
        let mut buf = PixelBuffer::new(4, 4);
        buf.fill(BLUE);
        let mut dirty = DirtyTracker::default();
        assert_eq!(flood_fill(&mut buf, &mut dirty, 2, 2, BLUE, 50.0), 0);
        assert!(dirty.peek().is_empty());
    }

    #[test]
    fn flood_fill_respects_tolerance() {
        let mut buf = PixelBuffer::new(3, 1);
        buf.put_pixel(0, 0, Rgba([100, 100, 100, 255]));
        buf.put_pixel(1, 0, Rgba([104, 100, 100, 255])); // distance 4
        buf.put_pixel(2, 0, Rgba([150, 100, 100, 255])); // distance 50
        let mut dirty = DirtyTracker::default();
        let filled = flood_fill(&mut buf, &mut dirty, 0, 0, BLUE, 5.0);
        assert_eq!(filled, 2);
        assert_eq!(buf.get_pixel(2, 0), Rgba([150, 100, 100, 255]));
    }
}
