//! ArcFace face recognizer via ONNX Runtime.
//!
//! Turns a 112x112 aligned crop into a raw 512-dimensional vector. The
//! vector is normalized by [`crate::embedding::normalize`], not here.

use crate::backend::{EmbeddingBackend, InferenceError};
use crate::types::Frame;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0 like SCRFD
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct ArcFaceRecognizer {
    session: Session,
    model_version: String,
    dim: usize,
}

impl ArcFaceRecognizer {
    /// Load the ArcFace ONNX model; the file stem becomes the model version tag.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        let model_version = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "arcface".to_string());

        Ok(Self {
            session,
            model_version,
            dim: ARCFACE_EMBEDDING_DIM,
        })
    }
}

impl EmbeddingBackend for ArcFaceRecognizer {
    fn embed(&mut self, crop: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(crop.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::Failed(format!("embedding extraction: {e}")))?;

        check_dim(raw, self.dim)
    }

    fn model_version(&self) -> Option<&str> {
        Some(&self.model_version)
    }
}

fn check_dim(raw: &[f32], dim: usize) -> Result<Vec<f32>, InferenceError> {
    if raw.len() != dim {
        return Err(InferenceError::UnexpectedOutput(format!(
            "expected {dim}-dim embedding, got {}",
            raw.len()
        )));
    }
    Ok(raw.to_vec())
}

/// Convert an aligned RGB crop into a `1×3×H×W` BGR tensor scaled to [-1, 1].
pub fn crop_tensor(aligned: &Frame) -> Array4<f32> {
    let w = aligned.width as usize;
    let h = aligned.height as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));

    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) * Frame::CHANNELS;
            let px = |c: usize| aligned.data.get(idx + c).copied().unwrap_or(0) as f32;
            tensor[[0, 0, y, x]] = (px(2) - ARCFACE_MEAN) / ARCFACE_STD;
            tensor[[0, 1, y, x]] = (px(1) - ARCFACE_MEAN) / ARCFACE_STD;
            tensor[[0, 2, y, x]] = (px(0) - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }

    tensor
}
