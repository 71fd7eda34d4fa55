// ============================================================================
// AFFINE MATRIX — 2D affine transforms stored as a homogeneous 4×4
// ============================================================================

use serde::{Deserialize, Serialize};

/// Determinant magnitude below which a matrix counts as singular.
const SINGULAR_EPS: f32 = 1e-6;

/// A 2D affine transform (translation, rotation, non-uniform scale, flips)
/// stored as a row-major homogeneous 4×4, so it stays composable with 3D
/// matrix pipelines.  Only the 2D affine slots are ever non-trivial; points
/// transform as:
///
/// ```text
///   x' = m[0]*x + m[1]*y + m[3]
///   y' = m[4]*x + m[5]*y + m[7]
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AffineMatrix {
    pub m: [f32; 16],
}

impl Default for AffineMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineMatrix {
    pub fn identity() -> Self {
        let mut m = [0.0; 16];
        m[0] = 1.0;
        m[5] = 1.0;
        m[10] = 1.0;
        m[15] = 1.0;
        Self { m }
    }

    /// Build from the six 2D affine coefficients.
    fn from_2d(a: f32, b: f32, tx: f32, c: f32, d: f32, ty: f32) -> Self {
        let mut out = Self::identity();
        out.m[0] = a;
        out.m[1] = b;
        out.m[3] = tx;
        out.m[4] = c;
        out.m[5] = d;
        out.m[7] = ty;
        out
    }

    pub fn translation(dx: f32, dy: f32) -> Self {
        Self::from_2d(1.0, 0.0, dx, 0.0, 1.0, dy)
    }

    /// Counter-clockwise rotation, `radians` about the origin.
    pub fn rotation(radians: f32) -> Self {
        let (s, c) = radians.sin_cos();
        Self::from_2d(c, -s, 0.0, s, c, 0.0)
    }

    /// Non-uniform scale; negative factors express flips.
    pub fn scaling(sx: f32, sy: f32) -> Self {
        Self::from_2d(sx, 0.0, 0.0, 0.0, sy, 0.0)
    }

    /// Full 4×4 product `self * rhs` (rhs applies first).
    pub fn mul(&self, rhs: &AffineMatrix) -> AffineMatrix {
        let mut out = [0.0f32; 16];
        for row in 0..4 {
            for col in 0..4 {
                let mut acc = 0.0;
                for k in 0..4 {
                    acc += self.m[row * 4 + k] * rhs.m[k * 4 + col];
                }
                out[row * 4 + col] = acc;
            }
        }
        AffineMatrix { m: out }
    }

    /// Apply the 2D affine part to a point.
    #[inline]
    pub fn transform_point(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.m[0] * x + self.m[1] * y + self.m[3],
            self.m[4] * x + self.m[5] * y + self.m[7],
        )
    }

    /// Determinant of the 2D linear part.
    #[inline]
    pub fn det2d(&self) -> f32 {
        self.m[0] * self.m[5] - self.m[1] * self.m[4]
    }

    /// Closed-form inverse of the 2D affine part.  Returns `None` for a
    /// singular or non-finite matrix — callers treat that as "no mapping",
    /// never as a panic.
    pub fn invert(&self) -> Option<AffineMatrix> {
        if !self.is_valid() {
            return None;
        }
        let (a, b, tx) = (self.m[0], self.m[1], self.m[3]);
        let (c, d, ty) = (self.m[4], self.m[5], self.m[7]);
        let inv_det = 1.0 / self.det2d();

        let ia = d * inv_det;
        let ib = -b * inv_det;
        let ic = -c * inv_det;
        let id = a * inv_det;
        Some(Self::from_2d(
            ia,
            ib,
            -(ia * tx + ib * ty),
            ic,
            id,
            -(ic * tx + id * ty),
        ))
    }

    /// Centralised validity guard: every slot finite and the 2D part
    /// invertible.  Checked at every boundary (session begin/commit/cancel,
    /// history capture/restore, project save/load).
    pub fn is_valid(&self) -> bool {
        self.m.iter().all(|v| v.is_finite()) && self.det2d().abs() > SINGULAR_EPS
    }

    pub fn is_identity(&self) -> bool {
        let id = Self::identity();
        self.m
            .iter()
            .zip(id.m.iter())
            .all(|(a, b)| (a - b).abs() < 1e-6)
    }
}

/// Return `m` unchanged when valid, otherwise identity — with a warning
/// naming the boundary that caught it.
pub fn valid_or_identity(m: AffineMatrix, context: &str) -> AffineMatrix {
    if m.is_valid() {
        m
    } else {
        crate::log_warn!("{}: invalid layer matrix, reset to identity", context);
        AffineMatrix::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn identity_maps_points_to_themselves() {
        let m = AffineMatrix::identity();
        assert_eq!(m.transform_point(3.5, -2.0), (3.5, -2.0));
        assert!(m.is_identity());
        assert!(m.is_valid());
    }

    #[test]
    fn translation_then_rotation_composes_right_to_left() {
        // rotate 90° CCW after translating by (1, 0): (0,0) → (1,0) → (0,1)
        let m = AffineMatrix::rotation(std::f32::consts::FRAC_PI_2)
            .mul(&AffineMatrix::translation(1.0, 0.0));
        let (x, y) = m.transform_point(0.0, 0.0);
        assert!(close(x, 0.0) && close(y, 1.0), "got ({}, {})", x, y);
    }

    #[test]
    fn invert_round_trips() {
        let m = AffineMatrix::translation(12.0, -3.0)
            .mul(&AffineMatrix::rotation(0.7))
            .mul(&AffineMatrix::scaling(2.0, 0.5));
        let inv = m.invert().unwrap();
        let (x, y) = m.transform_point(5.0, 9.0);
        let (bx, by) = inv.transform_point(x, y);
        assert!(close(bx, 5.0) && close(by, 9.0));
    }

    #[test]
    fn flip_is_invertible() {
        let m = AffineMatrix::scaling(-1.0, 1.0);
        assert!(m.is_valid());
        let inv = m.invert().unwrap();
        let (x, y) = inv.transform_point(-4.0, 2.0);
        assert!(close(x, 4.0) && close(y, 2.0));
    }

    #[test]
    fn singular_and_nan_matrices_are_invalid() {
        assert!(!AffineMatrix::scaling(0.0, 1.0).is_valid());
        assert!(AffineMatrix::scaling(0.0, 1.0).invert().is_none());

        let mut m = AffineMatrix::identity();
        m.m[0] = f32::NAN;
        assert!(!m.is_valid());
        assert!(m.invert().is_none());
        assert!(valid_or_identity(m, "test").is_identity());
    }
}
