use crate::canvas::Layer;
use crate::matrix::AffineMatrix;

// ============================================================================
// COORDINATE MAPPER — screen ↔ canvas ↔ layer-local conversions
// ============================================================================

/// The single global viewport transform (pan/zoom/rotation/flip), independent
/// of any layer.
#[derive(Clone, Copy, Debug)]
pub struct ViewTransform {
    pub pan_x: f32,
    pub pan_y: f32,
    pub zoom: f32,
    /// Radians, counter-clockwise.
    pub rotation: f32,
    pub flip_horizontal: bool,
}

impl Default for ViewTransform {
    fn default() -> Self {
        Self {
            pan_x: 0.0,
            pan_y: 0.0,
            zoom: 1.0,
            rotation: 0.0,
            flip_horizontal: false,
        }
    }
}

impl ViewTransform {
    /// Canvas → screen matrix: scale (with flip), then rotate, then pan.
    pub fn to_matrix(&self) -> AffineMatrix {
        let sx = if self.flip_horizontal { -self.zoom } else { self.zoom };
        AffineMatrix::translation(self.pan_x, self.pan_y)
            .mul(&AffineMatrix::rotation(self.rotation))
            .mul(&AffineMatrix::scaling(sx, self.zoom))
    }
}

/// Undo the viewport transform on a screen-space point.  `None` when the
/// view matrix is degenerate (e.g. zoom 0).
pub fn screen_to_canvas(point: (f32, f32), view: &ViewTransform) -> Option<(f32, f32)> {
    let inv = view.to_matrix().invert()?;
    Some(inv.transform_point(point.0, point.1))
}

/// Map a canvas-space point into a layer's local space via the inverse of
/// the layer matrix.  An inversion failure means the point cannot be on the
/// layer — callers get `None`, never a panic.
pub fn canvas_to_layer_local(point: (f32, f32), layer: &Layer) -> Option<(f32, f32)> {
    let inv = layer.matrix.invert()?;
    Some(inv.transform_point(point.0, point.1))
}

/// A point is "on" the layer iff its local coordinates fall within
/// `[0, width) × [0, height)`.
pub fn point_on_layer(point: (f32, f32), layer: &Layer) -> bool {
    match canvas_to_layer_local(point, layer) {
        Some((lx, ly)) => {
            lx >= 0.0
                && ly >= 0.0
                && lx < layer.pixels.width() as f32
                && ly < layer.pixels.height() as f32
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn test_layer(w: u32, h: u32) -> Layer {
        Layer::new("Ink".into(), w, h, Rgba([0, 0, 0, 0]))
    }

    #[test]
    fn screen_round_trips_through_the_view() {
        let view = ViewTransform {
            pan_x: 40.0,
            pan_y: -12.0,
            zoom: 2.5,
            rotation: 0.3,
            flip_horizontal: true,
        };
        let m = view.to_matrix();
        let (sx, sy) = m.transform_point(17.0, 23.0);
        let (cx, cy) = screen_to_canvas((sx, sy), &view).unwrap();
        assert!((cx - 17.0).abs() < 1e-3 && (cy - 23.0).abs() < 1e-3);
    }

    #[test]
    fn degenerate_zoom_yields_no_mapping() {
        let view = ViewTransform {
            zoom: 0.0,
            ..Default::default()
        };
        assert!(screen_to_canvas((5.0, 5.0), &view).is_none());
    }

    #[test]
    fn rotation_about_center_fixes_the_center_point() {
        // layer matrix = 45° rotation about its own center
        let mut layer = test_layer(10, 10);
        let center = (5.0, 5.0);
        layer.matrix = AffineMatrix::translation(center.0, center.1)
            .mul(&AffineMatrix::rotation(std::f32::consts::FRAC_PI_4))
            .mul(&AffineMatrix::translation(-center.0, -center.1));

        let (lx, ly) = canvas_to_layer_local(center, &layer).unwrap();
        assert!((lx - center.0).abs() < 1e-4 && (ly - center.1).abs() < 1e-4);
        assert!(point_on_layer(center, &layer));
    }

    #[test]
    fn non_invertible_layer_matrix_means_not_on_layer() {
        let mut layer = test_layer(10, 10);
        layer.matrix = AffineMatrix::scaling(0.0, 1.0);
        assert!(canvas_to_layer_local((5.0, 5.0), &layer).is_none());
        assert!(!point_on_layer((5.0, 5.0), &layer));
    }

    #[test]
    fn points_outside_the_buffer_are_off_layer() {
        let layer = test_layer(10, 10);
        assert!(point_on_layer((0.0, 0.0), &layer));
        assert!(point_on_layer((9.9, 9.9), &layer));
        assert!(!point_on_layer((10.0, 5.0), &layer));
        assert!(!point_on_layer((-0.1, 5.0), &layer));
    }
}
