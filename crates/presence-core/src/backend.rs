//! Inference engine boundary.
//!
//! The pipeline only sees these traits; the ONNX Runtime implementations live
//! in [`crate::detector`] and [`crate::recognizer`], and tests plug in fakes.

use crate::decoder::StrideOutputs;
use ndarray::Array4;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("inference failed: {0}")]
    Failed(String),
    #[error("unexpected output: {0}")]
    UnexpectedOutput(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face detector producing raw per-stride buffers for a letterboxed tensor.
pub trait DetectionBackend: Send {
    fn detect(&mut self, tensor: &Array4<f32>) -> Result<Vec<StrideOutputs>, InferenceError>;
}

/// A face recognizer producing one raw (unnormalized) vector per aligned crop.
pub trait EmbeddingBackend: Send {
    fn embed(&mut self, crop: &Array4<f32>) -> Result<Vec<f32>, InferenceError>;

    /// Tag stored alongside embeddings so libraries from different models don't mix.
    fn model_version(&self) -> Option<&str> {
        None
    }
}

impl<T: DetectionBackend + ?Sized> DetectionBackend for Box<T> {
    fn detect(&mut self, tensor: &Array4<f32>) -> Result<Vec<StrideOutputs>, InferenceError> {
        (**self).detect(tensor)
    }
}

impl<T: EmbeddingBackend + ?Sized> EmbeddingBackend for Box<T> {
    fn embed(&mut self, crop: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        (**self).embed(crop)
    }

    fn model_version(&self) -> Option<&str> {
        (**self).model_version()
    }
}
