use crate::source::{FrameSource, ImageFrameSource, SourceError};
use chrono::Utc;
use presence_core::detector::{DetectorError, ScrfdDetector};
use presence_core::pacing::{FrameOutcome, Pacer};
use presence_core::recognizer::{ArcFaceRecognizer, RecognizerError};
use presence_core::{CancelFlag, FacePipeline, Gaze, Settings, LibrarySnapshot, PipelineError, PresenceEvent, PresenceEventKind};
use serde::Serialize;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc as async_mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("frame source error: {0}")]
    Source(#[from] SourceError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// A presence change ready to be published.
#[derive(Debug, Clone)]
pub struct PresenceNotice {
    /// `None` for the anonymous "someone is here" presence.
    pub name: Option<String>,
    pub kind: PresenceEventKind,
    /// Wall-clock time of the frame that caused it, in Unix milliseconds.
    pub at_ms: i64,
}

impl PresenceNotice {
    fn from_event(event: PresenceEvent) -> Self {
        let age = Instant::now().saturating_duration_since(event.at);
        let age_ms = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
        Self {
            name: event.name,
            kind: event.kind,
            at_ms: Utc::now().timestamp_millis().saturating_sub(age_ms),
        }
    }
}

/// Snapshot of the frame loop, served by the `Status` D-Bus method.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub source: String,
    pub model_version: Option<String>,
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub last_faces: usize,
    pub avg_inference_ms: u64,
    pub interval_ms: u64,
    pub library_size: usize,
    #[serde(flatten)]
    pub presence: PresenceSnapshot,
}

/// Who is in front of the camera, as of the last processed frame.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PresenceSnapshot {
    /// Confirmed names.
    pub present: Vec<String>,
    pub someone_present: bool,
    pub unknown_faces: usize,
    pub gaze: Option<Gaze>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Status { reply: oneshot::Sender<EngineStatus> },
    Present { reply: oneshot::Sender<PresenceSnapshot> },
    /// Skip the remaining wait and capture now.
    Wake,
    Shutdown,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply })
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn present(&self) -> Result<PresenceSnapshot, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Present { reply })
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub fn wake(&self) {
        let _ = self.tx.send(EngineRequest::Wake);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(EngineRequest::Shutdown);
    }
}

/// Spawn the frame loop on a dedicated OS thread.
///
/// Loads both ONNX models and opens the frame source first, so a missing
/// model or source fails startup instead of the first frame.
pub fn spawn_engine(
    config: &Settings,
    library: LibrarySnapshot,
    cancel: CancelFlag,
    notices: async_mpsc::UnboundedSender<PresenceNotice>,
) -> Result<EngineHandle, EngineError> {
    let detector = ScrfdDetector::load(&config.detector_path(), &config.pipeline.detection.strides)?;
    let recognizer = ArcFaceRecognizer::load(&config.recognizer_path())?;
    let source = ImageFrameSource::open(&config.source)?;

    let pipeline = FacePipeline::new(detector, recognizer, &config.pipeline);
    let pacer = Pacer::new(config.pipeline.pacing.clone(), Instant::now());

    let (tx, rx) = mpsc::channel::<EngineRequest>();

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut engine = Engine {
                pipeline,
                pacer,
                source: Box::new(source),
                library,
                cancel,
                notices,
                status: EngineStatus::default(),
            };
            engine.run(rx);
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

struct Engine {
    pipeline: FacePipeline<ScrfdDetector, ArcFaceRecognizer>,
    pacer: Pacer,
    source: Box<dyn FrameSource>,
    library: LibrarySnapshot,
    cancel: CancelFlag,
    notices: async_mpsc::UnboundedSender<PresenceNotice>,
    status: EngineStatus,
}

impl Engine {
    fn run(&mut self, rx: mpsc::Receiver<EngineRequest>) {
        self.status.source = self.source.describe();
        self.status.model_version = self.pipeline.model_version().map(str::to_string);
        let mut next_capture = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let wait = next_capture.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(EngineRequest::Status { reply }) => {
                    let _ = reply.send(self.snapshot_status());
                    continue;
                }
                Ok(EngineRequest::Present { reply }) => {
                    let _ = reply.send(self.status.presence.clone());
                    continue;
                }
                Ok(EngineRequest::Wake) => {}
                Ok(EngineRequest::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if !self.pacer.try_begin() {
                continue;
            }
            let outcome = self.capture_and_process();
            let now = Instant::now();
            self.pacer.finish(now, outcome);
            if self.cancel.is_cancelled() {
                break;
            }
            next_capture = now + self.pacer.next_interval(now);
        }
    }

    fn capture_and_process(&mut self) -> FrameOutcome {
        let frame = match self.source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed");
                self.status.frames_failed += 1;
                return FrameOutcome::Failed;
            }
        };

        // Held for the whole frame; a concurrent reload only affects the next one
        let library = self.library.load();
        let started = Instant::now();

        match self.pipeline.process_frame(&frame, &library, Instant::now(), &self.cancel) {
            Ok(report) => {
                self.status.frames_processed += 1;
                self.status.last_faces = report.faces.len();
                self.status.library_size = library.len();
                self.status.presence = PresenceSnapshot {
                    present: report.present.clone(),
                    someone_present: report.someone_present,
                    unknown_faces: report.unknown_faces,
                    gaze: report.gaze,
                };
                tracing::debug!(
                    faces = report.faces.len(),
                    present = report.present.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "frame processed"
                );

                for event in report.events {
                    // Fire-and-forget: nobody listening is not an error
                    let _ = self.notices.send(PresenceNotice::from_event(event));
                }

                FrameOutcome::Processed {
                    latency: report.inference,
                    faces: report.faces.len(),
                }
            }
            Err(PipelineError::Cancelled) => {
                tracing::info!("frame abandoned: shutting down");
                FrameOutcome::Failed
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame failed");
                self.status.frames_failed += 1;
                FrameOutcome::Failed
            }
        }
    }

    fn snapshot_status(&self) -> EngineStatus {
        let now = Instant::now();
        EngineStatus {
            avg_inference_ms: duration_ms(self.pacer.average_latency()),
            interval_ms: duration_ms(self.pacer.next_interval(now)),
            library_size: self.library.load().len(),
            ..self.status.clone()
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_time_is_wall_clock() {
        let event = PresenceEvent {
            name: Some("Alex".into()),
            kind: PresenceEventKind::Arrived,
            at: Instant::now(),
        };
        let before = Utc::now().timestamp_millis();
        let notice = PresenceNotice::from_event(event);
        let after = Utc::now().timestamp_millis();
        assert_eq!(notice.name.as_deref(), Some("Alex"));
        assert!(notice.at_ms >= before - 5 && notice.at_ms <= after);
    }

    #[test]
    fn test_notice_backdated_by_event_age() {
        let Some(at) = Instant::now().checked_sub(Duration::from_secs(2)) else {
            return;
        };
        let event = PresenceEvent {
            name: None,
            kind: PresenceEventKind::Departed,
            at,
        };
        let now = Utc::now().timestamp_millis();
        let notice = PresenceNotice::from_event(event);
        assert!(notice.name.is_none());
        assert!((now - notice.at_ms - 2_000).abs() < 100);
    }

    #[test]
    fn test_status_serializes() {
        let status = EngineStatus {
            presence: PresenceSnapshot {
                present: vec!["Alex".into()],
                someone_present: true,
                unknown_faces: 1,
                gaze: Some(Gaze { x: 0.5, y: -0.25 }),
            },
            ..EngineStatus::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["present"][0], "Alex");
        assert_eq!(json["someone_present"], true);
        assert_eq!(json["unknown_faces"], 1);
        assert_eq!(json["gaze"]["x"], 0.5);
        assert_eq!(json["frames_processed"], 0);
    }
}
