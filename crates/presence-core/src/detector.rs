//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the model on a letterboxed tensor and hands back the raw per-stride
//! buffers; anchor decoding and suppression happen in [`crate::decoder`] and
//! [`crate::nms`].

use crate::backend::{DetectionBackend, InferenceError};
use crate::decoder::StrideOutputs;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

pub const SCRFD_MEAN: f32 = 127.5;
pub const SCRFD_STD: f32 = 128.0;

const SCORE_DIM: usize = 1;
const BOX_DIM: usize = 4;
const KPS_DIM: usize = 10;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unsupported detector model: {0}")]
    Unsupported(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideSlots {
    stride: usize,
    score: usize,
    bbox: usize,
    kps: Option<usize>,
}

/// How the model's outputs map onto strides.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OutputLayout {
    /// Tensors named `score_8`, `bbox_8`, `kps_8`, ...
    Named(Vec<StrideSlots>),
    /// Generic names: group by trailing dimension at run time.
    ByShape,
}

/// One extracted output tensor.
#[derive(Debug, Clone)]
struct RawOutput {
    last_dim: usize,
    data: Vec<f32>,
}

pub struct ScrfdDetector {
    session: Session,
    strides: Vec<usize>,
    output_count: usize,
    layout: OutputLayout,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, strides: &[usize]) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        // Score and box heads are mandatory for every stride; keypoints are not
        if output_names.len() < strides.len() * 2 {
            return Err(DetectorError::Unsupported(format!(
                "{} strides need at least {} outputs, got {}",
                strides.len(),
                strides.len() * 2,
                output_names.len()
            )));
        }

        let layout = discover_layout(&output_names, strides);
        tracing::debug!(?layout, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            strides: strides.to_vec(),
            output_count: output_names.len(),
            layout,
        })
    }
}

impl DetectionBackend for ScrfdDetector {
    fn detect(&mut self, tensor: &Array4<f32>) -> Result<Vec<StrideOutputs>, InferenceError> {
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(tensor.view())?])?;

        let mut raw = Vec::with_capacity(self.output_count);
        for i in 0..self.output_count {
            match outputs[i].try_extract_tensor::<f32>() {
                Ok((shape, data)) => raw.push(Some(RawOutput {
                    last_dim: shape.last().map(|&d| d.max(0) as usize).unwrap_or(1),
                    data: data.to_vec(),
                })),
                Err(e) => {
                    // Reported as a missing buffer; the decoder skips that stride
                    tracing::warn!(output = i, error = %e, "could not extract detector output");
                    raw.push(None);
                }
            }
        }

        Ok(assemble(&self.layout, &self.strides, raw))
    }
}

/// Map outputs to strides by name when the export names them.
fn discover_layout(names: &[String], strides: &[usize]) -> OutputLayout {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let slots: Option<Vec<StrideSlots>> = strides
        .iter()
        .map(|&stride| {
            Some(StrideSlots {
                stride,
                score: find("score", stride)?,
                bbox: find("bbox", stride)?,
                kps: find("kps", stride),
            })
        })
        .collect();

    match slots {
        Some(slots) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            OutputLayout::Named(slots)
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, grouping outputs by shape");
            OutputLayout::ByShape
        }
    }
}

/// Indices of outputs with the given trailing dimension, largest buffer first.
fn group_by_dim(raw: &[Option<RawOutput>], dim: usize) -> Vec<usize> {
    let mut group: Vec<usize> = raw
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.as_ref().filter(|r| r.last_dim == dim).map(|_| i))
        .collect();
    // Finer strides have more anchors; stable sort keeps export order on ties
    group.sort_by_key(|&i| std::cmp::Reverse(raw[i].as_ref().map_or(0, |r| r.data.len())));
    group
}

fn assemble(layout: &OutputLayout, strides: &[usize], mut raw: Vec<Option<RawOutput>>) -> Vec<StrideOutputs> {
    let plan: Vec<(usize, Option<usize>, Option<usize>, Option<usize>)> = match layout {
        OutputLayout::Named(slots) => slots
            .iter()
            .map(|s| (s.stride, Some(s.score), Some(s.bbox), s.kps))
            .collect(),
        OutputLayout::ByShape => {
            let scores = group_by_dim(&raw, SCORE_DIM);
            let boxes = group_by_dim(&raw, BOX_DIM);
            let kps = group_by_dim(&raw, KPS_DIM);
            strides
                .iter()
                .enumerate()
                .map(|(pos, &stride)| {
                    (
                        stride,
                        scores.get(pos).copied(),
                        boxes.get(pos).copied(),
                        kps.get(pos).copied(),
                    )
                })
                .collect()
        }
    };

    let mut take = |idx: Option<usize>| -> Option<Vec<f32>> {
        idx.and_then(|i| raw.get_mut(i)).and_then(Option::take).map(|r| r.data)
    };

    plan.into_iter()
        .map(|(stride, score, bbox, kps)| StrideOutputs {
            stride,
            scores: take(score).unwrap_or_default(),
            boxes: take(bbox).unwrap_or_default(),
            landmarks: take(kps),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRIDES: [usize; 3] = [8, 16, 32];

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn raw(last_dim: usize, anchors: usize, fill: f32) -> Option<RawOutput> {
        Some(RawOutput {
            last_dim,
            data: vec![fill; anchors * last_dim],
        })
    }

    #[test]
    fn test_discover_layout_named() {
        let layout = discover_layout(
            &names(&[
                "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8", "kps_16", "kps_32",
            ]),
            &STRIDES,
        );
        let OutputLayout::Named(slots) = layout else {
            panic!("expected named layout");
        };
        assert_eq!(slots[0], StrideSlots { stride: 8, score: 0, bbox: 3, kps: Some(6) });
        assert_eq!(slots[2], StrideSlots { stride: 32, score: 2, bbox: 5, kps: Some(8) });
    }

    #[test]
    fn test_discover_layout_shuffled_named() {
        let layout = discover_layout(
            &names(&[
                "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32",
            ]),
            &STRIDES,
        );
        let OutputLayout::Named(slots) = layout else {
            panic!("expected named layout");
        };
        assert_eq!(slots[0], StrideSlots { stride: 8, score: 2, bbox: 0, kps: Some(1) });
        assert_eq!(slots[1], StrideSlots { stride: 16, score: 5, bbox: 3, kps: Some(4) });
    }

    #[test]
    fn test_discover_layout_without_keypoints() {
        let layout = discover_layout(
            &names(&["score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32"]),
            &STRIDES,
        );
        let OutputLayout::Named(slots) = layout else {
            panic!("expected named layout");
        };
        assert!(slots.iter().all(|s| s.kps.is_none()));
    }

    #[test]
    fn test_discover_layout_generic_names() {
        let generic: Vec<String> = (400..409).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_layout(&generic, &STRIDES), OutputLayout::ByShape);
    }

    #[test]
    fn test_assemble_by_shape_orders_largest_first() {
        // 640 input: 12800 / 3200 / 800 anchors, exported in scrambled order
        let outputs = vec![
            raw(1, 800, 0.3),
            raw(4, 12800, 1.0),
            raw(1, 12800, 0.1),
            raw(10, 3200, 2.0),
            raw(1, 3200, 0.2),
            raw(4, 800, 3.0),
            raw(10, 12800, 1.0),
            raw(4, 3200, 2.0),
            raw(10, 800, 3.0),
        ];
        let strides = assemble(&OutputLayout::ByShape, &STRIDES, outputs);
        assert_eq!(strides.len(), 3);
        assert_eq!(strides[0].stride, 8);
        assert_eq!(strides[0].scores.len(), 12800);
        assert_eq!(strides[0].scores[0], 0.1);
        assert_eq!(strides[1].boxes.len(), 3200 * 4);
        assert_eq!(strides[2].scores[0], 0.3);
        assert_eq!(strides[2].landmarks.as_ref().map(Vec::len), Some(8000));
    }

    #[test]
    fn test_assemble_missing_buffer_left_empty() {
        let layout = OutputLayout::Named(vec![StrideSlots { stride: 8, score: 0, bbox: 1, kps: Some(2) }]);
        let strides = assemble(&layout, &[8], vec![raw(1, 4, 0.9), None, raw(10, 4, 0.0)]);
        assert_eq!(strides[0].scores.len(), 4);
        assert!(strides[0].boxes.is_empty());
        assert!(strides[0].landmarks.is_some());
    }

    #[test]
    fn test_load_missing_model() {
        let err = ScrfdDetector::load(Path::new("/nonexistent/det_10g.onnx"), &STRIDES).err();
        assert!(matches!(err, Some(DetectorError::ModelNotFound(_))));
    }
}
