//! Pipeline tuning parameters.
//!
//! Every field has a default, so a TOML file only needs the values it changes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detection: DetectionConfig,
    pub matching: MatchConfig,
    pub presence: PresenceConfig,
    pub pacing: PacingConfig,
}

/// SCRFD geometry and post-processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Square input side in pixels.
    pub input_size: usize,
    /// Output head strides, in the order the model emits them.
    pub strides: Vec<usize>,
    /// Minimum score for a candidate to be kept.
    pub confidence_threshold: f32,
    /// Overlap above which the weaker of two detections is dropped.
    pub iou_threshold: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            strides: vec![8, 16, 32],
            confidence_threshold: 0.5,
            iou_threshold: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Cosine similarity the best name must exceed.
    pub threshold: f32,
    /// Required lead of the best name over the runner-up.
    pub margin: f32,
    pub top_k: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: 0.65,
            margin: 0.08,
            top_k: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Consecutive sightings before a presence counts as confirmed.
    pub confirm_frames: u32,
    pub departure_ms: u64,
    pub forget_ms: u64,
}

impl PresenceConfig {
    pub fn departure(&self) -> Duration {
        Duration::from_millis(self.departure_ms)
    }

    pub fn forget(&self) -> Duration {
        Duration::from_millis(self.forget_ms)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            confirm_frames: 4,
            departure_ms: 3_000,
            forget_ms: 60_000,
        }
    }
}

/// Frame loop self-pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Interval floor once no face has been seen for `idle_after_ms`.
    pub idle_interval_ms: u64,
    pub idle_after_ms: u64,
    /// Interval as a multiple of the average inference latency.
    pub inference_multiplier: f32,
    /// Latency assumed before the first measurement.
    pub initial_inference_ms: u64,
    /// Fixed interval overriding the adaptive one; 0 = automatic.
    pub manual_interval_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 800,
            max_interval_ms: 5_000,
            idle_interval_ms: 3_000,
            idle_after_ms: 10_000,
            inference_multiplier: 1.5,
            initial_inference_ms: 500,
            manual_interval_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"matching": {"threshold": 0.7}, "presence": {"confirm_frames": 2}}"#).unwrap();
        assert_eq!(cfg.matching.threshold, 0.7);
        assert_eq!(cfg.matching.margin, 0.08);
        assert_eq!(cfg.presence.confirm_frames, 2);
        assert_eq!(cfg.presence.departure(), Duration::from_secs(3));
        assert_eq!(cfg.detection.strides, vec![8, 16, 32]);
        assert_eq!(cfg.pacing.max_interval_ms, 5_000);
    }
}
