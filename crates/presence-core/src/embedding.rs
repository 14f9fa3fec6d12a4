//! L2 normalization of raw recognizer output.

use crate::types::Embedding;

/// A normalized recognizer output.
///
/// `Invalid` carries a zero vector of the same dimension; it comes from a
/// zero-norm or non-finite raw vector (e.g. a corrupt crop) and must be
/// treated as "no match possible" for that face.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEmbedding {
    Valid(Embedding),
    Invalid(Embedding),
}

impl NormalizedEmbedding {
    pub fn is_valid(&self) -> bool {
        matches!(self, NormalizedEmbedding::Valid(_))
    }

    pub fn embedding(&self) -> &Embedding {
        match self {
            NormalizedEmbedding::Valid(e) | NormalizedEmbedding::Invalid(e) => e,
        }
    }

    /// The unit embedding, or `None` when invalid.
    pub fn into_valid(self) -> Option<Embedding> {
        match self {
            NormalizedEmbedding::Valid(e) => Some(e),
            NormalizedEmbedding::Invalid(_) => None,
        }
    }
}

/// Divide every component by the vector's L2 norm.
pub fn normalize(raw: Vec<f32>, model_version: Option<&str>) -> NormalizedEmbedding {
    let model_version = model_version.map(str::to_string);
    // Accumulate in f64 so large 512-d activations don't overflow
    let norm = raw.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();

    if norm > 0.0 && norm.is_finite() {
        let values = raw.iter().map(|&x| (x as f64 / norm) as f32).collect();
        NormalizedEmbedding::Valid(Embedding {
            values,
            model_version,
        })
    } else {
        NormalizedEmbedding::Invalid(Embedding {
            values: vec![0.0; raw.len()],
            model_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l2(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn test_normalize_unit_norm() {
        let inputs: Vec<Vec<f32>> = vec![
            vec![3.0, 4.0],
            vec![1e-20, 0.0, 0.0],
            vec![-7.5; 512],
            (0..512).map(|i| ((i * 37) % 101) as f32 - 50.0).collect(),
            vec![1e30, 1e30, -1e30],
        ];
        for raw in inputs {
            let n = normalize(raw, None);
            assert!(n.is_valid());
            let norm = l2(&n.embedding().values);
            assert!((norm - 1.0).abs() < 1e-5, "norm = {norm}");
        }
    }

    #[test]
    fn test_normalize_values() {
        let n = normalize(vec![3.0, 4.0], Some("w600k_r50")).into_valid().unwrap();
        assert!((n.values[0] - 0.6).abs() < 1e-6);
        assert!((n.values[1] - 0.8).abs() < 1e-6);
        assert_eq!(n.model_version.as_deref(), Some("w600k_r50"));
    }

    #[test]
    fn test_normalize_zero_vector_invalid() {
        let n = normalize(vec![0.0; 512], None);
        assert!(!n.is_valid());
        let e = n.embedding();
        assert_eq!(e.values.len(), 512);
        assert!(e.values.iter().all(|&v| v == 0.0));
        assert!(n.into_valid().is_none());
    }

    #[test]
    fn test_normalize_nan_invalid() {
        let n = normalize(vec![1.0, f32::NAN, 2.0], None);
        assert!(!n.is_valid());
        assert!(n.embedding().values.iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn test_normalize_empty_invalid() {
        assert!(!normalize(Vec::new(), None).is_valid());
    }
}
