//! Per-frame driver: detection through presence tracking.
//!
//! `FacePipeline` owns everything one frame needs: the anchor table, both
//! inference backends, the matcher and the presence tracker. It is driven by
//! a single caller (the daemon's engine thread or the CLI) and never shared.

use crate::alignment::{self, AlignmentError};
use crate::anchors::AnchorTable;
use crate::backend::{DetectionBackend, EmbeddingBackend, InferenceError};
use crate::config::PipelineConfig;
use crate::decoder;
use crate::detector::{SCRFD_MEAN, SCRFD_STD};
use crate::embedding::{self, NormalizedEmbedding};
use crate::letterbox::letterbox_tensor;
use crate::matcher::{MarginMatcher, Matcher};
use crate::nms;
use crate::presence::{PresenceEvent, PresenceTracker};
use crate::recognizer::crop_tensor;
use crate::types::{Detection, Embedding, Frame, Gaze, LibraryEntry, MatchResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("malformed frame: {width}x{height} with {len} bytes")]
    MalformedFrame { width: u32, height: u32, len: usize },
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("frame cancelled")]
    Cancelled,
}

/// Shared "stop what you're doing" flag checked between pipeline stages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Why a detected face could not be matched.
#[derive(Debug, Clone, PartialEq)]
pub enum Unresolved {
    NoLandmarks,
    Alignment(AlignmentError),
    InvalidEmbedding,
}

/// Outcome for one face, in source-frame coordinates.
#[derive(Debug, Clone)]
pub struct FaceReport {
    pub detection: Detection,
    pub result: MatchResult,
    /// Normalized embedding, when one could be computed.
    pub embedding: Option<Embedding>,
    pub unresolved: Option<Unresolved>,
}

impl FaceReport {
    fn unresolved(detection: Detection, reason: Unresolved) -> Self {
        Self {
            detection,
            result: MatchResult::unknown(),
            embedding: None,
            unresolved: Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameReport {
    pub faces: Vec<FaceReport>,
    /// Faces in this frame without an accepted identity.
    pub unknown_faces: usize,
    /// Where to look, toward the faces in this frame.
    pub gaze: Option<Gaze>,
    /// Names confirmed present after this frame.
    pub present: Vec<String>,
    /// Whether anyone, recognized or not, is confirmed present.
    pub someone_present: bool,
    pub events: Vec<PresenceEvent>,
    /// Wall time spent in detection and recognition.
    pub inference: Duration,
}

pub struct FacePipeline<D, E> {
    anchors: AnchorTable,
    detector: D,
    recognizer: E,
    matcher: MarginMatcher,
    tracker: PresenceTracker,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl<D: DetectionBackend, E: EmbeddingBackend> FacePipeline<D, E> {
    pub fn new(detector: D, recognizer: E, config: &PipelineConfig) -> Self {
        let anchors = AnchorTable::new(config.detection.input_size, &config.detection.strides);
        tracing::debug!(
            input_size = config.detection.input_size,
            anchors = anchors.len(),
            "anchor table built"
        );
        Self {
            anchors,
            detector,
            recognizer,
            matcher: MarginMatcher::new(&config.matching),
            tracker: PresenceTracker::new(&config.presence),
            confidence_threshold: config.detection.confidence_threshold,
            iou_threshold: config.detection.iou_threshold,
        }
    }

    pub fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    pub fn model_version(&self) -> Option<&str> {
        self.recognizer.model_version()
    }

    /// Detect, embed and match every face without touching presence state.
    pub fn analyze(
        &mut self,
        frame: &Frame,
        library: &[LibraryEntry],
        cancel: &CancelFlag,
    ) -> Result<(Vec<FaceReport>, Duration), PipelineError> {
        let (tensor, letterbox) =
            letterbox_tensor(frame, self.anchors.input_size(), SCRFD_MEAN, SCRFD_STD).ok_or(
                PipelineError::MalformedFrame {
                    width: frame.width,
                    height: frame.height,
                    len: frame.data.len(),
                },
            )?;

        let mut inference = Duration::ZERO;
        let started = Instant::now();
        let outputs = self.detector.detect(&tensor)?;
        inference += started.elapsed();
        cancel.check()?;

        let candidates = decoder::decode(&outputs, &self.anchors, self.confidence_threshold);
        let kept = nms::suppress(&candidates, self.iou_threshold);
        tracing::debug!(candidates = candidates.len(), faces = kept.len(), "detections decoded");

        let mut faces = Vec::with_capacity(kept.len());
        for idx in kept {
            cancel.check()?;
            let detection = letterbox.to_source(&candidates[idx]);

            let Some(landmarks) = detection.landmarks else {
                faces.push(FaceReport::unresolved(detection, Unresolved::NoLandmarks));
                continue;
            };

            let aligned = match alignment::align_face(frame, &landmarks) {
                Ok(aligned) => aligned,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping face with unusable landmarks");
                    faces.push(FaceReport::unresolved(detection, Unresolved::Alignment(e)));
                    continue;
                }
            };

            let started = Instant::now();
            let raw = self.recognizer.embed(&crop_tensor(&aligned))?;
            inference += started.elapsed();

            let embedding = match embedding::normalize(raw, self.recognizer.model_version()) {
                NormalizedEmbedding::Valid(e) => e,
                NormalizedEmbedding::Invalid(_) => {
                    tracing::warn!(confidence = detection.confidence, "recognizer returned an invalid embedding");
                    faces.push(FaceReport::unresolved(detection, Unresolved::InvalidEmbedding));
                    continue;
                }
            };

            let result = self.matcher.compare(&embedding, library);
            tracing::debug!(
                name = result.name.as_deref().unwrap_or("unknown"),
                similarity = result.similarity,
                accepted = result.accepted,
                "face matched"
            );

            faces.push(FaceReport {
                detection,
                result,
                embedding: Some(embedding),
                unresolved: None,
            });
        }

        Ok((faces, inference))
    }

    /// Run one frame end to end and advance the presence tracker.
    ///
    /// On any error the tracker is left exactly as it was.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        library: &[LibraryEntry],
        now: Instant,
        cancel: &CancelFlag,
    ) -> Result<FrameReport, PipelineError> {
        let (faces, inference) = self.analyze(frame, library, cancel)?;
        cancel.check()?;

        let seen = faces.iter().filter_map(|f| f.result.name.as_deref());
        let events = self.tracker.update(now, faces.len(), seen);
        for event in &events {
            tracing::info!(name = event.label(), event = event.kind.as_str(), "presence changed");
        }

        Ok(FrameReport {
            unknown_faces: unknown_faces(&faces),
            gaze: Gaze::toward(faces.iter().map(|f| &f.detection.bbox), frame.width, frame.height),
            present: self.tracker.present(),
            someone_present: self.tracker.someone_present(),
            faces,
            events,
            inference,
        })
    }
}

fn unknown_faces(faces: &[FaceReport]) -> usize {
    faces.iter().filter(|f| f.result.name.is_none()).count()
}
