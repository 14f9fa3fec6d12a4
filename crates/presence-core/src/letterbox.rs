//! Letterbox resize into the square detector input, and its inverse.

use crate::types::{BoundingBox, Detection, Frame, Landmarks};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb};
use ndarray::Array4;

/// How a source frame was scaled and centered into the square input tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Fit a `src_w × src_h` frame inside an `input_size` square, preserving aspect.
    ///
    /// Returns `None` for empty frames.
    pub fn fit(src_w: u32, src_h: u32, input_size: usize) -> Option<Self> {
        if src_w == 0 || src_h == 0 || input_size == 0 {
            return None;
        }
        let size = input_size as f32;
        let scale = (size / src_w as f32).min(size / src_h as f32);
        let (scaled_w, scaled_h) = scaled_dims(src_w, src_h, scale);
        Some(Self {
            scale,
            pad_x: ((size - scaled_w as f32) / 2.0).round(),
            pad_y: ((size - scaled_h as f32) / 2.0).round(),
        })
    }

    /// Map a point from input-tensor space back to source-frame pixels.
    pub fn point_to_source(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }

    /// Map a point from source-frame pixels into input-tensor space.
    pub fn point_to_tensor(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (x * self.scale + self.pad_x, y * self.scale + self.pad_y)
    }

    /// Return a copy of `det` with box and landmarks in source-frame pixels.
    pub fn to_source(&self, det: &Detection) -> Detection {
        let (x1, y1) = self.point_to_source((det.bbox.x1, det.bbox.y1));
        let (x2, y2) = self.point_to_source((det.bbox.x2, det.bbox.y2));

        let landmarks = det.landmarks.map(|lms| {
            let mut out: Landmarks = lms;
            for p in out.iter_mut() {
                *p = self.point_to_source(*p);
            }
            out
        });

        Detection {
            bbox: BoundingBox { x1, y1, x2, y2 },
            confidence: det.confidence,
            landmarks,
        }
    }
}

fn scaled_dims(src_w: u32, src_h: u32, scale: f32) -> (usize, usize) {
    (
        ((src_w as f32 * scale).round() as usize).max(1),
        ((src_h as f32 * scale).round() as usize).max(1),
    )
}

/// Letterbox an RGB frame into a `1×3×S×S` BGR tensor normalized as `(p - mean) / std`.
///
/// The frame is resized with a triangle (bilinear) filter and centered;
/// padding is filled with `mean`, which normalizes to 0.0. Returns `None`
/// when the frame buffer does not match its declared size.
pub fn letterbox_tensor(
    frame: &Frame,
    input_size: usize,
    mean: f32,
    std: f32,
) -> Option<(Array4<f32>, Letterbox)> {
    if !frame.is_well_formed() {
        return None;
    }
    let letterbox = Letterbox::fit(frame.width, frame.height, input_size)?;
    let (new_w, new_h) = scaled_dims(frame.width, frame.height, letterbox.scale);

    let source = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(frame.width, frame.height, &frame.data[..])?;
    let resized = imageops::resize(&source, new_w as u32, new_h as u32, FilterType::Triangle);

    let pad_x = letterbox.pad_x.max(0.0) as usize;
    let pad_y = letterbox.pad_y.max(0.0) as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));

    for y in 0..input_size {
        for x in 0..input_size {
            let inside = y >= pad_y && y < pad_y + new_h && x >= pad_x && x < pad_x + new_w;
            let [r, g, b] = if inside {
                let Rgb([r, g, b]) = *resized.get_pixel((x - pad_x) as u32, (y - pad_y) as u32);
                [f32::from(r), f32::from(g), f32::from(b)]
            } else {
                [mean; 3]
            };

            // BGR channel order (OpenCV training convention)
            tensor[[0, 0, y, x]] = (b - mean) / std;
            tensor[[0, 1, y, x]] = (g - mean) / std;
            tensor[[0, 2, y, x]] = (r - mean) / std;
        }
    }

    Some((tensor, letterbox))
}
