//! SCRFD output decoding.
//!
//! Turns the raw per-stride score / box-distance / keypoint-offset buffers
//! into detections in input-tensor pixel space.

use crate::anchors::{AnchorSlot, AnchorTable};
use crate::types::{BoundingBox, Detection, Landmarks};

const BOX_VALUES: usize = 4;
const KPS_VALUES: usize = 10;

/// Raw detector output for one stride, as returned by the inference engine.
///
/// `scores` holds one value per anchor (logits or probabilities), `boxes`
/// four distances (left, top, right, bottom) and `landmarks` ten offsets per
/// anchor, all in stride units.
#[derive(Debug, Clone, Default)]
pub struct StrideOutputs {
    pub stride: usize,
    pub scores: Vec<f32>,
    pub boxes: Vec<f32>,
    pub landmarks: Option<Vec<f32>>,
}

/// A stride whose buffers passed validation against the anchor table.
struct ValidStride<'a> {
    anchors: &'a [AnchorSlot],
    scores: &'a [f32],
    boxes: &'a [f32],
    landmarks: Option<&'a [f32]>,
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Check every stride once; malformed ones are dropped with a warning.
fn validate<'a>(outputs: &'a [StrideOutputs], table: &'a AnchorTable) -> Vec<ValidStride<'a>> {
    let mut valid = Vec::with_capacity(outputs.len());

    for out in outputs {
        let Some(anchors) = table.for_stride(out.stride) else {
            tracing::warn!(stride = out.stride, "no anchors for stride; skipping");
            continue;
        };
        let n = anchors.len();

        if out.scores.len() < n || out.boxes.len() < n * BOX_VALUES {
            tracing::warn!(
                stride = out.stride,
                anchors = n,
                scores = out.scores.len(),
                boxes = out.boxes.len(),
                "short detector output; skipping stride"
            );
            continue;
        }

        let landmarks = match &out.landmarks {
            Some(kps) if kps.len() >= n * KPS_VALUES => Some(&kps[..n * KPS_VALUES]),
            Some(kps) => {
                tracing::debug!(stride = out.stride, len = kps.len(), "short keypoint output; ignoring landmarks");
                None
            }
            None => None,
        };

        valid.push(ValidStride {
            anchors,
            scores: &out.scores[..n],
            boxes: &out.boxes[..n * BOX_VALUES],
            landmarks,
        });
    }

    valid
}

/// Decode all strides into detections whose score exceeds `confidence_floor`.
///
/// Scores are treated as logits for the whole frame when any raw score
/// exceeds 1.0, otherwise as probabilities. The decision is global so one
/// frame is never scored two different ways.
pub fn decode(outputs: &[StrideOutputs], table: &AnchorTable, confidence_floor: f32) -> Vec<Detection> {
    let strides = validate(outputs, table);

    let max_raw = strides
        .iter()
        .flat_map(|s| s.scores.iter().copied())
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    let logits = max_raw > 1.0;
    tracing::trace!(max_raw, logits, "score domain");

    let mut detections = Vec::new();

    for s in &strides {
        for (idx, anchor) in s.anchors.iter().enumerate() {
            let raw = s.scores[idx];
            let score = if logits { sigmoid(raw) } else { raw };
            if score.is_nan() || score <= confidence_floor {
                continue;
            }

            let stride = anchor.stride as f32;
            let (cx, cy) = (anchor.center_x, anchor.center_y);

            let b = &s.boxes[idx * BOX_VALUES..(idx + 1) * BOX_VALUES];
            let bbox = BoundingBox {
                x1: cx - b[0] * stride,
                y1: cy - b[1] * stride,
                x2: cx + b[2] * stride,
                y2: cy + b[3] * stride,
            };

            let landmarks = s.landmarks.map(|kps| {
                let k = &kps[idx * KPS_VALUES..(idx + 1) * KPS_VALUES];
                let mut lms: Landmarks = [(0.0, 0.0); 5];
                for (i, lm) in lms.iter_mut().enumerate() {
                    *lm = (cx + k[i * 2] * stride, cy + k[i * 2 + 1] * stride);
                }
                lms
            });

            detections.push(Detection {
                bbox,
                confidence: score,
                landmarks,
            });
        }
    }

    detections
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Zeroed outputs for every stride of a tiny 64px table.
    fn blank(table: &AnchorTable) -> Vec<StrideOutputs> {
        table
            .strides()
            .map(|stride| {
                let n = table.for_stride(stride).unwrap().len();
                StrideOutputs {
                    stride,
                    scores: vec![0.0; n],
                    boxes: vec![0.0; n * 4],
                    landmarks: Some(vec![0.0; n * 10]),
                }
            })
            .collect()
    }

    #[test]
    fn test_decode_box_and_landmarks() {
        let table = AnchorTable::new(64, &[16, 32]);
        let mut outs = blank(&table);

        // stride 32, grid 2x2; anchor index 2 is cell (0,1) centered at (48,16)
        outs[1].scores[2] = 0.9;
        outs[1].boxes[8..12].copy_from_slice(&[0.5, 0.25, 0.5, 1.0]);
        outs[1].landmarks.as_mut().unwrap()[20..30]
            .copy_from_slice(&[-0.25, 0.0, 0.25, 0.0, 0.0, 0.25, -0.25, 0.5, 0.25, 0.5]);

        let dets = decode(&outs, &table, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!(d.bbox, BoundingBox { x1: 32.0, y1: 8.0, x2: 64.0, y2: 48.0 });
        assert!((d.confidence - 0.9).abs() < 1e-6);
        let lms = d.landmarks.unwrap();
        assert_eq!(lms[0], (40.0, 16.0));
        assert_eq!(lms[1], (56.0, 16.0));
        assert_eq!(lms[2], (48.0, 24.0));
        assert_eq!(lms[4], (56.0, 32.0));
    }

    #[test]
    fn test_decode_probabilities_not_sigmoided() {
        let table = AnchorTable::new(32, &[16]);
        let mut outs = blank(&table);
        outs[0].scores[0] = 0.8;
        outs[0].scores[1] = 0.4;
        let dets = decode(&outs, &table, 0.5);
        assert_eq!(dets.len(), 1);
        assert!((dets[0].confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_decode_logits_sigmoided_globally() {
        let table = AnchorTable::new(32, &[16]);
        let mut outs = blank(&table);
        outs[0].scores[0] = 3.0; // forces logit mode for the frame
        outs[0].scores[1] = 0.9; // sigmoid(0.9) ≈ 0.711, still a detection
        outs[0].scores[2] = -2.0; // sigmoid ≈ 0.119
        let dets = decode(&outs, &table, 0.5);
        assert_eq!(dets.len(), 2);
        assert!((dets[0].confidence - sigmoid(3.0)).abs() < 1e-6);
        assert!((dets[1].confidence - sigmoid(0.9)).abs() < 1e-6);
    }

    #[test]
    fn test_decode_skips_malformed_stride() {
        let table = AnchorTable::new(64, &[16, 32]);
        let mut outs = blank(&table);
        outs[0].scores.truncate(3); // stride 16 broken
        outs[0].scores[0] = 0.99;
        outs[1].scores[0] = 0.7;
        let dets = decode(&outs, &table, 0.5);
        assert_eq!(dets.len(), 1);
        assert!((dets[0].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_decode_short_landmarks_keeps_box() {
        let table = AnchorTable::new(32, &[16]);
        let mut outs = blank(&table);
        outs[0].scores[0] = 0.9;
        outs[0].landmarks = Some(vec![0.0; 7]);
        let dets = decode(&outs, &table, 0.5);
        assert_eq!(dets.len(), 1);
        assert!(dets[0].landmarks.is_none());
    }

    #[test]
    fn test_decode_unknown_stride_ignored() {
        let table = AnchorTable::new(32, &[16]);
        let outs = vec![StrideOutputs {
            stride: 8,
            scores: vec![0.9; 32],
            boxes: vec![0.0; 128],
            landmarks: None,
        }];
        assert!(decode(&outs, &table, 0.5).is_empty());
    }

    #[test]
    fn test_decode_nan_scores_dropped() {
        let table = AnchorTable::new(32, &[16]);
        let mut outs = blank(&table);
        outs[0].scores[0] = f32::NAN;
        outs[0].scores[1] = 0.6;
        let dets = decode(&outs, &table, 0.5);
        assert_eq!(dets.len(), 1);
    }
}
