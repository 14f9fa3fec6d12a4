use serde::{Deserialize, Serialize};

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Axis-aligned box in corner form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Area, or 0.0 for inverted or non-finite boxes.
    pub fn area(&self) -> f32 {
        let area = self.width().max(0.0) * self.height().max(0.0);
        if area.is_finite() { area } else { 0.0 }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// Where to look: the mean face-box centre, normalized to [-1, 1].
///
/// `x` is mirrored so that +1 is the viewer's left as seen by the camera;
/// `y` grows downward and is damped by [`Gaze::VERTICAL_GAIN`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gaze {
    pub x: f32,
    pub y: f32,
}

impl Gaze {
    pub const VERTICAL_GAIN: f32 = 0.6;

    /// Gaze toward the faces in a `width × height` frame, `None` when there are none.
    pub fn toward<'a, I>(boxes: I, width: u32, height: u32) -> Option<Self>
    where
        I: IntoIterator<Item = &'a BoundingBox>,
    {
        if width == 0 || height == 0 {
            return None;
        }
        let (mut sum_x, mut sum_y, mut n) = (0.0f32, 0.0f32, 0usize);
        for bbox in boxes {
            let (cx, cy) = bbox.center();
            sum_x += cx;
            sum_y += cy;
            n += 1;
        }
        if n == 0 {
            return None;
        }
        let (mx, my) = (sum_x / n as f32, sum_y / n as f32);
        let x = -((mx / width as f32) * 2.0 - 1.0);
        let y = ((my / height as f32) * 2.0 - 1.0) * Self::VERTICAL_GAIN;
        Some(Self {
            x: x.clamp(-1.0, 1.0),
            y: y.clamp(-1.0, 1.0),
        })
    }
}

/// A single detected face.
///
/// Coordinates are in whichever space the producing stage works in: the
/// decoder emits input-tensor pixels, the letterbox mapper returns copies in
/// source-frame pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Detector score in [0, 1].
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

/// An RGB8 camera frame, interleaved, row-major.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub const CHANNELS: usize = 3;

    pub fn from_image(image: &image::DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self {
            data: rgb.into_raw(),
            width,
            height,
        }
    }

    /// Whether the buffer actually holds `width * height` RGB pixels.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() >= self.width as usize * self.height as usize * Self::CHANNELS
    }

    /// Bilinear RGB sample at a sub-pixel position.
    ///
    /// Neighbours outside the frame contribute `fill`. Callers must check
    /// [`is_well_formed`](Self::is_well_formed) first.
    pub fn sample_bilinear(&self, x: f32, y: f32, fill: f32) -> [f32; 3] {
        let w = self.width as i64;
        let h = self.height as i64;

        let x0f = x.floor();
        let y0f = y.floor();
        let fx = x - x0f;
        let fy = y - y0f;
        let x0 = x0f as i64;
        let y0 = y0f as i64;

        let pixel = |px: i64, py: i64| -> [f32; 3] {
            if px >= 0 && px < w && py >= 0 && py < h {
                let off = (py as usize * self.width as usize + px as usize) * Self::CHANNELS;
                [
                    self.data[off] as f32,
                    self.data[off + 1] as f32,
                    self.data[off + 2] as f32,
                ]
            } else {
                [fill; 3]
            }
        };

        let tl = pixel(x0, y0);
        let tr = pixel(x0.saturating_add(1), y0);
        let bl = pixel(x0, y0.saturating_add(1));
        let br = pixel(x0.saturating_add(1), y0.saturating_add(1));

        let mut out = [0.0f32; 3];
        for c in 0..3 {
            out[c] = tl[c] * (1.0 - fx) * (1.0 - fy)
                + tr[c] * fx * (1.0 - fy)
                + bl[c] * (1.0 - fx) * fy
                + br[c] * fx * fy;
        }
        out
    }
}

/// Face embedding vector (512-dimensional for ArcFace w600k_r50).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Mismatched
    /// dimensions or zero vectors compare as 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 && denom.is_finite() { dot / denom } else { 0.0 }
    }
}

/// One enrolled face sample. A person may have many entries under one name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub id: String,
    pub name: String,
    pub embedding: Embedding,
}

/// Best similarity of one enrolled name against a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    pub similarity: f32,
}

/// Result of matching a query embedding against the face library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Accepted identity, `None` when unknown.
    pub name: Option<String>,
    /// Similarity of the top candidate, 0.0 when there is none.
    pub similarity: f32,
    pub accepted: bool,
    /// Ranked per-name candidates, best first.
    pub candidates: Vec<Candidate>,
}

impl MatchResult {
    /// "No match possible" result, used for faces without a usable embedding.
    pub fn unknown() -> Self {
        Self {
            name: None,
            similarity: 0.0,
            accepted: false,
            candidates: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(cx: f32, cy: f32) -> BoundingBox {
        BoundingBox { x1: cx - 10.0, y1: cy - 10.0, x2: cx + 10.0, y2: cy + 10.0 }
    }

    #[test]
    fn test_gaze_centered_face_looks_ahead() {
        let g = Gaze::toward([&square(320.0, 240.0)], 640, 480).unwrap();
        assert!(g.x.abs() < 1e-6 && g.y.abs() < 1e-6);
    }

    #[test]
    fn test_gaze_mirrors_x_and_damps_y() {
        let g = Gaze::toward([&square(160.0, 480.0)], 640, 480).unwrap();
        assert!((g.x - 0.5).abs() < 1e-6);
        assert!((g.y - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_gaze_averages_faces() {
        let boxes = [square(0.0, 240.0), square(640.0, 240.0)];
        let g = Gaze::toward(&boxes, 640, 480).unwrap();
        assert!(g.x.abs() < 1e-6);
        assert!(Gaze::toward(std::iter::empty(), 640, 480).is_none());
    }

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding { values, model_version: None }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&a.clone()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(emb(vec![1.0, 0.0]).similarity(&emb(vec![0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let s = emb(vec![1.0, 0.0]).similarity(&emb(vec![-1.0, 0.0]));
        assert!((s + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(emb(vec![0.0, 0.0]).similarity(&emb(vec![1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_cosine_similarity_dimension_mismatch() {
        assert_eq!(emb(vec![1.0, 0.0]).similarity(&emb(vec![1.0, 0.0, 0.0])), 0.0);
    }

    #[test]
    fn test_bbox_area_inverted_is_zero() {
        let b = BoundingBox { x1: 10.0, y1: 10.0, x2: 5.0, y2: 20.0 };
        assert_eq!(b.area(), 0.0);
    }

    #[test]
    fn test_frame_well_formed() {
        let frame = Frame { data: vec![0; 4 * 2 * 3], width: 4, height: 2 };
        assert!(frame.is_well_formed());
        let short = Frame { data: vec![0; 5], width: 4, height: 2 };
        assert!(!short.is_well_formed());
    }
}
