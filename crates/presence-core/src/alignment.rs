//! Face alignment via 4-DOF similarity transform.
//!
//! Aligns detected faces to a canonical 112×112 position using the five
//! InsightFace reference landmarks and the Umeyama closed-form estimate
//! (rotation, uniform scale, translation; never a reflection).

use crate::types::{Frame, Landmarks};
use thiserror::Error;

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Below this mean squared spread (px²) the source points are treated as coincident.
const MIN_SOURCE_VARIANCE: f64 = 1e-6;
/// Minor/major spread ratio under which the source points are treated as collinear.
const MIN_SPREAD_RATIO: f64 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("degenerate landmarks: {0}")]
    Degenerate(&'static str),
    #[error("alignment produced a non-finite transform")]
    NonFinite,
}

/// Affine map `(x, y) -> (a·x + b·y + tx, c·x + d·y + ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentTransform {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub tx: f32,
    pub ty: f32,
}

impl AlignmentTransform {
    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x + self.b * y + self.tx,
            self.c * x + self.d * y + self.ty,
        )
    }

    /// Determinant of the linear part; positive for a proper similarity.
    pub fn determinant(&self) -> f32 {
        self.a * self.d - self.b * self.c
    }

    /// Uniform scale factor.
    pub fn scale(&self) -> f32 {
        self.determinant().max(0.0).sqrt()
    }

    /// Rotation angle in radians.
    pub fn rotation(&self) -> f32 {
        self.c.atan2(self.a)
    }

    /// Inverse map, or `None` when the linear part is singular.
    pub fn inverse(&self) -> Option<AlignmentTransform> {
        let det = self.determinant();
        if det.abs() < 1e-12 || !det.is_finite() {
            return None;
        }
        let inv = 1.0 / det;
        let a = self.d * inv;
        let b = -self.b * inv;
        let c = -self.c * inv;
        let d = self.a * inv;
        Some(AlignmentTransform {
            a,
            b,
            c,
            d,
            tx: -(a * self.tx + b * self.ty),
            ty: -(c * self.tx + d * self.ty),
        })
    }

    fn is_finite(&self) -> bool {
        [self.a, self.b, self.c, self.d, self.tx, self.ty]
            .iter()
            .all(|v| v.is_finite())
    }
}

type Mat2 = [[f64; 2]; 2];

fn rotation(theta: f64) -> Mat2 {
    let (s, c) = theta.sin_cos();
    [[c, -s], [s, c]]
}

fn det2(m: &Mat2) -> f64 {
    m[0][0] * m[1][1] - m[0][1] * m[1][0]
}

/// Closed-form SVD of a 2×2 matrix: `m = U · diag(S) · Vᵀ`, `S[0] >= S[1] >= 0`.
///
/// Splits `m` into a scaled-rotation part and a scaled-reflection part and
/// reads both angles off with `atan2`. U and V start as rotations; when the
/// reflection part dominates, the second column of U is flipped so S stays
/// non-negative, leaving det(U) = -1 for the caller to correct.
fn svd2x2(m: &Mat2) -> (Mat2, [f64; 2], Mat2) {
    let e = (m[0][0] + m[1][1]) / 2.0;
    let f = (m[0][0] - m[1][1]) / 2.0;
    let g = (m[1][0] + m[0][1]) / 2.0;
    let h = (m[1][0] - m[0][1]) / 2.0;

    let q = e.hypot(h);
    let r = f.hypot(g);
    let a1 = g.atan2(f);
    let a2 = h.atan2(e);

    let mut u = rotation((a2 + a1) / 2.0);
    let v = rotation((a1 - a2) / 2.0);

    let mut s = [q + r, q - r];
    if s[1] < 0.0 {
        s[1] = -s[1];
        u[0][1] = -u[0][1];
        u[1][1] = -u[1][1];
    }

    (u, s, v)
}

fn centroid(points: &Landmarks) -> (f64, f64) {
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x as f64, ay + y as f64));
    (sx / n, sy / n)
}

/// Estimate the similarity transform mapping `src` onto `dst` (Umeyama).
///
/// Fails on coincident or collinear source points, and on any non-finite
/// intermediate value, so callers can drop the face instead of warping
/// with NaN.
pub fn estimate_similarity(src: &Landmarks, dst: &Landmarks) -> Result<AlignmentTransform, AlignmentError> {
    let n = src.len() as f64;
    let (smx, smy) = centroid(src);
    let (dmx, dmy) = centroid(dst);

    let mut src_var = 0.0f64;
    let mut src_cov: Mat2 = [[0.0; 2]; 2];
    let mut cov: Mat2 = [[0.0; 2]; 2];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let s = [sx as f64 - smx, sy as f64 - smy];
        let d = [dx as f64 - dmx, dy as f64 - dmy];
        src_var += s[0] * s[0] + s[1] * s[1];
        for i in 0..2 {
            for j in 0..2 {
                cov[i][j] += d[i] * s[j];
                src_cov[i][j] += s[i] * s[j];
            }
        }
    }
    src_var /= n;
    for row in cov.iter_mut().chain(src_cov.iter_mut()) {
        for v in row.iter_mut() {
            *v /= n;
        }
    }

    if !src_var.is_finite() {
        return Err(AlignmentError::NonFinite);
    }
    if src_var < MIN_SOURCE_VARIANCE {
        return Err(AlignmentError::Degenerate("coincident points"));
    }
    // Smallest eigenvalue of the source scatter vs its trace
    let tr = src_cov[0][0] + src_cov[1][1];
    let disc = ((src_cov[0][0] - src_cov[1][1]).powi(2) + 4.0 * src_cov[0][1] * src_cov[1][0]).sqrt();
    let minor = 0.5 * (tr - disc);
    if minor / tr < MIN_SPREAD_RATIO {
        return Err(AlignmentError::Degenerate("collinear points"));
    }

    let (u, s, v) = svd2x2(&cov);

    // Reflection correction: force det(R) = +1
    let mut dsign = [1.0f64, 1.0];
    if det2(&u) * det2(&v) < 0.0 {
        dsign[1] = -1.0;
    }

    let mut r: Mat2 = [[0.0; 2]; 2];
    for i in 0..2 {
        for j in 0..2 {
            r[i][j] = u[i][0] * dsign[0] * v[j][0] + u[i][1] * dsign[1] * v[j][1];
        }
    }

    let scale = (s[0] * dsign[0] + s[1] * dsign[1]) / src_var;
    if !scale.is_finite() || scale <= 0.0 {
        return Err(AlignmentError::Degenerate("non-positive scale"));
    }

    let tx = dmx - scale * (r[0][0] * smx + r[0][1] * smy);
    let ty = dmy - scale * (r[1][0] * smx + r[1][1] * smy);

    let transform = AlignmentTransform {
        a: (scale * r[0][0]) as f32,
        b: (scale * r[0][1]) as f32,
        c: (scale * r[1][0]) as f32,
        d: (scale * r[1][1]) as f32,
        tx: tx as f32,
        ty: ty as f32,
    };

    if !transform.is_finite() {
        return Err(AlignmentError::NonFinite);
    }
    Ok(transform)
}

/// Resample a `size × size` crop: each output pixel is inverse-mapped into
/// the frame and sampled bilinearly. Out-of-bounds pixels are black.
pub fn warp_affine(frame: &Frame, transform: &AlignmentTransform, size: usize) -> Result<Frame, AlignmentError> {
    let inv = transform.inverse().ok_or(AlignmentError::Degenerate("singular transform"))?;

    let mut data = vec![0u8; size * size * Frame::CHANNELS];
    if frame.is_well_formed() {
        for oy in 0..size {
            for ox in 0..size {
                let (sx, sy) = inv.apply((ox as f32, oy as f32));
                let px = frame.sample_bilinear(sx, sy, 0.0);
                let off = (oy * size + ox) * Frame::CHANNELS;
                for c in 0..Frame::CHANNELS {
                    data[off + c] = px[c].round().clamp(0.0, 255.0) as u8;
                }
            }
        }
    }

    Ok(Frame {
        data,
        width: size as u32,
        height: size as u32,
    })
}

/// Align a detected face to a canonical 112×112 RGB crop for ArcFace.
pub fn align_face(frame: &Frame, landmarks: &Landmarks) -> Result<Frame, AlignmentError> {
    let transform = estimate_similarity(landmarks, &REFERENCE_LANDMARKS_112)?;
    warp_affine(frame, &transform, ALIGNED_SIZE)
}
