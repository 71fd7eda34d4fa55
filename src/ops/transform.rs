// ============================================================================
// TRANSFORM SESSION — transactional move/rotate/scale/flip of one layer
// ============================================================================

use rayon::prelude::*;
use uuid::Uuid;

use crate::canvas::{Layer, PixelBuffer, Sampling};
use crate::matrix::{self, AffineMatrix};

/// Phase of an active session.  Idle is represented by the session not
/// existing at all (the engine holds `Option<TransformSession>`), so the
/// full machine is Idle → Pending → Dragging → {Committed | Cancelled} → Idle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// Begun, no delta applied yet ("click without drag").
    Pending,
    /// At least one delta applied; commit will bake pixels.
    Dragging,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlipAxis {
    Horizontal,
    Vertical,
}

/// One incremental gesture update, always expressed relative to the state at
/// session start.
#[derive(Clone, Copy, Debug)]
pub struct TransformDelta {
    pub translate: (f32, f32),
    /// Radians, counter-clockwise, about the layer-center pivot.
    pub rotation: f32,
    pub scale: f32,
    pub flip: Option<FlipAxis>,
}

impl Default for TransformDelta {
    fn default() -> Self {
        Self {
            translate: (0.0, 0.0),
            rotation: 0.0,
            scale: 1.0,
            flip: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Pixels baked, matrix reset to identity.
    Committed,
    /// Never dragged — nothing written, nothing to record.
    NoChange,
    /// Baking failed; the backup was restored verbatim.
    RolledBack,
}

/// A transactional, non-destructive transform of one layer's content.
/// During preview only the layer matrix changes; pixels are rewritten once,
/// on commit.  Exactly one session may exist document-wide — enforced by the
/// engine owning at most one.
pub struct TransformSession {
    pub layer_id: Uuid,
    backup_pixels: PixelBuffer,
    backup_matrix: AffineMatrix,
    phase: SessionPhase,
}

impl TransformSession {
    /// Begin a session on `layer`.  Refused (None) for invisible layers.
    /// An invalid resident matrix is repaired to identity before backup so
    /// cancel can never restore a corrupt state.
    pub fn begin(layer: &mut Layer) -> Option<Self> {
        if !layer.visible {
            return None;
        }
        layer.matrix = matrix::valid_or_identity(layer.matrix, "transform begin");
        Some(Self {
            layer_id: layer.id,
            backup_pixels: layer.pixels.clone(),
            backup_matrix: layer.matrix,
            phase: SessionPhase::Pending,
        })
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Compose the delta about the layer-center pivot and left-multiply it
    /// onto the *backup* matrix, so every delta is relative to session start
    /// rather than to the previous delta — repeated nudges cannot accumulate
    /// floating-point drift.
    ///
    /// A delta that would make the matrix non-invertible (or non-finite) is
    /// rejected and the layer matrix resets to identity with a warning.
    pub fn apply_delta(&mut self, layer: &mut Layer, delta: &TransformDelta) -> bool {
        if layer.id != self.layer_id {
            return false;
        }

        let (mut sx, mut sy) = (delta.scale, delta.scale);
        match delta.flip {
            Some(FlipAxis::Horizontal) => sx = -sx,
            Some(FlipAxis::Vertical) => sy = -sy,
            None => {}
        }

        let cx = layer.pixels.width() as f32 / 2.0;
        let cy = layer.pixels.height() as f32 / 2.0;

        let incremental = AffineMatrix::translation(delta.translate.0, delta.translate.1)
            .mul(&AffineMatrix::translation(cx, cy))
            .mul(&AffineMatrix::rotation(delta.rotation))
            .mul(&AffineMatrix::scaling(sx, sy))
            .mul(&AffineMatrix::translation(-cx, -cy));

        let composed = incremental.mul(&self.backup_matrix);
        if !composed.is_valid() {
            crate::log_warn!("transform delta produced an invalid matrix; layer reset to identity");
            layer.matrix = AffineMatrix::identity();
            return false;
        }

        layer.matrix = composed;
        self.phase = SessionPhase::Dragging;
        true
    }

    /// Bake the preview into pixels.
    ///
    /// Still Pending ⇒ the session just dissolves (`NoChange`): nothing was
    /// written, so a click without a drag leaves the layer untouched.
    /// Otherwise the layer is resampled under its current matrix into a new
    /// same-size buffer; on success it replaces the pixels and the matrix
    /// resets to identity, so committing never leaves a residual transform.
    /// A failed bake (singular matrix, or all content pushed outside the
    /// buffer) restores the backup verbatim instead.
    pub fn commit(self, layer: &mut Layer, sampling: Sampling) -> CommitOutcome {
        if self.phase == SessionPhase::Pending || layer.id != self.layer_id {
            return CommitOutcome::NoChange;
        }

        let baked = bake_layer(&layer.pixels, &layer.matrix, sampling);
        let usable = match &baked {
            Some(buf) => !(buf.is_fully_transparent() && !self.backup_pixels.is_fully_transparent()),
            None => false,
        };

        if let (Some(buf), true) = (baked, usable) {
            layer.pixels = buf;
            layer.matrix = AffineMatrix::identity();
            layer.mark_content_changed();
            CommitOutcome::Committed
        } else {
            crate::log_warn!(
                "transform commit on '{}' produced no usable pixels; backup restored",
                layer.name
            );
            layer.pixels = self.backup_pixels;
            layer.matrix = self.backup_matrix;
            layer.mark_content_changed();
            CommitOutcome::RolledBack
        }
    }

    /// Restore pixels and matrix exactly as they were at `begin`.  Legal
    /// from any phase and always succeeds.
    pub fn cancel(self, layer: &mut Layer) {
        if layer.id != self.layer_id {
            return;
        }
        layer.pixels = self.backup_pixels;
        layer.matrix = self.backup_matrix;
        layer.mark_content_changed();
    }
}

/// Resample `src` under `matrix` into a new same-size buffer via inverse
/// mapping — "what the user now sees".  `None` when the matrix cannot be
/// inverted.
pub(crate) fn bake_layer(
    src: &PixelBuffer,
    matrix: &AffineMatrix,
    sampling: Sampling,
) -> Option<PixelBuffer> {
    let inv = matrix.invert()?;
    let w = src.width();
    let h = src.height();
    let mut dst = PixelBuffer::new(w, h);
    let row_bytes = w as usize * 4;

    dst.as_raw_mut()
        .par_chunks_mut(row_bytes)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..w as usize {
                let (lx, ly) = inv.transform_point(x as f32, y as f32);
                let px = match sampling {
                    Sampling::Nearest => src.sample_nearest(lx, ly),
                    Sampling::Bilinear => src.sample_bilinear(lx, ly),
                };
                row[x * 4..x * 4 + 4].copy_from_slice(&px.0);
            }
        });

    Some(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

    fn ink_layer() -> Layer {
        let mut layer = Layer::new("Ink".into(), 8, 8, Rgba([0, 0, 0, 0]));
        layer.pixels.put_pixel(2, 2, RED);
        layer
    }

    #[test]
    fn begin_refuses_hidden_layers() {
        let mut layer = ink_layer();
        layer.visible = false;
        assert!(TransformSession::begin(&mut layer).is_none());
    }

    #[test]
    fn cancel_restores_bit_identical_state() {
        let mut layer = ink_layer();
        let before_pixels = layer.pixels.clone();
        let before_matrix = layer.matrix;

        let mut session = TransformSession::begin(&mut layer).unwrap();
        session.apply_delta(
            &mut layer,
            &TransformDelta {
                translate: (3.0, -1.0),
                rotation: 0.5,
                scale: 1.4,
                flip: Some(FlipAxis::Horizontal),
            },
        );
        session.cancel(&mut layer);

        assert!(layer.pixels == before_pixels);
        assert_eq!(layer.matrix, before_matrix);
    }

    #[test]
    fn commit_resets_matrix_to_identity() {
        let mut layer = ink_layer();
        let mut session = TransformSession::begin(&mut layer).unwrap();
        for _ in 0..4 {
            session.apply_delta(
                &mut layer,
                &TransformDelta {
                    translate: (1.0, 0.0),
                    ..Default::default()
                },
            );
        }
        assert_eq!(
            session.commit(&mut layer, Sampling::Nearest),
            CommitOutcome::Committed
        );
        assert!(layer.matrix.is_identity());
    }

    #[test]
    fn deltas_are_relative_to_session_start() {
        let mut layer = ink_layer();
        let mut session = TransformSession::begin(&mut layer).unwrap();
        let delta = TransformDelta {
            translate: (1.0, 0.0),
            ..Default::default()
        };
        // applying the same delta repeatedly must not accumulate
        session.apply_delta(&mut layer, &delta);
        session.apply_delta(&mut layer, &delta);
        session.apply_delta(&mut layer, &delta);
        session.commit(&mut layer, Sampling::Nearest);

        assert_eq!(layer.pixels.get_pixel(3, 2), RED, "moved by exactly one pixel");
        assert_eq!(layer.pixels.get_pixel(5, 2)[3], 0);
    }

    #[test]
    fn pending_commit_is_a_no_op_click() {
        let mut layer = ink_layer();
        let before = layer.pixels.clone();
        let session = TransformSession::begin(&mut layer).unwrap();
        assert_eq!(
            session.commit(&mut layer, Sampling::Bilinear),
            CommitOutcome::NoChange
        );
        assert!(layer.pixels == before);
        assert!(layer.matrix.is_identity());
    }

    #[test]
    fn commit_that_loses_all_content_rolls_back() {
        let mut layer = ink_layer();
        let before = layer.pixels.clone();
        let mut session = TransformSession::begin(&mut layer).unwrap();
        // push the content far outside the buffer
        session.apply_delta(
            &mut layer,
            &TransformDelta {
                translate: (10_000.0, 0.0),
                ..Default::default()
            },
        );
        assert_eq!(
            session.commit(&mut layer, Sampling::Nearest),
            CommitOutcome::RolledBack
        );
        assert!(layer.pixels == before);
        assert!(layer.matrix.is_identity(), "backup matrix was identity");
    }

    #[test]
    fn degenerate_scale_delta_is_rejected() {
        let mut layer = ink_layer();
        let mut session = TransformSession::begin(&mut layer).unwrap();
        let ok = session.apply_delta(
            &mut layer,
            &TransformDelta {
                scale: 0.0,
                ..Default::default()
            },
        );
        assert!(!ok);
        assert!(layer.matrix.is_identity());
    }

    #[test]
    fn horizontal_flip_mirrors_about_the_center() {
        let mut layer = ink_layer();
        let mut session = TransformSession::begin(&mut layer).unwrap();
        session.apply_delta(
            &mut layer,
            &TransformDelta {
                flip: Some(FlipAxis::Horizontal),
                ..Default::default()
            },
        );
        assert_eq!(
            session.commit(&mut layer, Sampling::Nearest),
            CommitOutcome::Committed
        );
        // (2, 2) mirrors to (width - 2, 2) about cx = 4
        assert_eq!(layer.pixels.get_pixel(6, 2), RED);
        assert_eq!(layer.pixels.get_pixel(2, 2)[3], 0);
    }
}
