//! Self-pacing of the capture loop.
//!
//! The interval between captures follows the measured inference latency so a
//! slow host is never asked for more frames than it can process, slows down
//! when nobody has been in view for a while, and backs off after failures.

use crate::config::PacingConfig;
use std::time::{Duration, Instant};

const LATENCY_ALPHA: f64 = 0.3;
/// Failures beyond this no longer grow the back-off factor.
const MAX_BACKOFF_SHIFT: u32 = 6;

/// Result of one pipeline run, as seen by the pacer.
#[derive(Debug, Clone, Copy)]
pub enum FrameOutcome {
    Processed { latency: Duration, faces: usize },
    Failed,
}

#[derive(Debug)]
pub struct Pacer {
    config: PacingConfig,
    avg_latency_ms: f64,
    last_face_at: Instant,
    failures: u32,
    busy: bool,
}

impl Pacer {
    pub fn new(config: PacingConfig, now: Instant) -> Self {
        Self {
            avg_latency_ms: config.initial_inference_ms as f64,
            config,
            last_face_at: now,
            failures: 0,
            busy: false,
        }
    }

    /// Claim the single inference slot. `false` while a frame is outstanding.
    pub fn try_begin(&mut self) -> bool {
        if self.busy {
            return false;
        }
        self.busy = true;
        true
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Release the slot and fold the outcome into the pacing state.
    pub fn finish(&mut self, now: Instant, outcome: FrameOutcome) {
        self.busy = false;
        match outcome {
            FrameOutcome::Processed { latency, faces } => {
                let ms = latency.as_secs_f64() * 1000.0;
                self.avg_latency_ms = LATENCY_ALPHA * ms + (1.0 - LATENCY_ALPHA) * self.avg_latency_ms;
                self.failures = 0;
                if faces > 0 {
                    self.last_face_at = now;
                }
            }
            FrameOutcome::Failed => {
                self.failures = self.failures.saturating_add(1);
                tracing::debug!(failures = self.failures, "frame failed; backing off");
            }
        }
    }

    pub fn average_latency(&self) -> Duration {
        Duration::from_secs_f64(self.avg_latency_ms.max(0.0) / 1000.0)
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_face_at) > Duration::from_millis(self.config.idle_after_ms)
    }

    /// Delay before the next capture.
    pub fn next_interval(&self, now: Instant) -> Duration {
        let cfg = &self.config;
        let base_ms = if cfg.manual_interval_ms > 0 {
            cfg.manual_interval_ms as f64
        } else {
            let mut ms = (self.avg_latency_ms * cfg.inference_multiplier as f64).max(cfg.min_interval_ms as f64);
            if self.is_idle(now) {
                ms = ms.max(cfg.idle_interval_ms as f64);
            }
            ms
        };

        let factor = (1u64 << self.failures.min(MAX_BACKOFF_SHIFT)) as f64;
        let ms = (base_ms * factor).min(cfg.max_interval_ms.max(cfg.min_interval_ms) as f64);
        Duration::from_millis(ms.round() as u64)
    }
}
