//! presence-core — face identity and presence pipeline.
//!
//! SCRFD detection decoding, five-point alignment, ArcFace embedding matching
//! against an enrolled library, and per-name presence debounce. Inference runs
//! through ONNX Runtime behind the [`backend`] traits.

pub mod alignment;
pub mod anchors;
pub mod backend;
pub mod config;
pub mod decoder;
pub mod detector;
pub mod embedding;
pub mod letterbox;
pub mod library;
pub mod matcher;
pub mod nms;
pub mod pacing;
pub mod pipeline;
pub mod presence;
pub mod recognizer;
pub mod settings;
pub mod types;

pub use config::PipelineConfig;
pub use library::{FaceLibrary, LibrarySnapshot};
pub use pipeline::{CancelFlag, FacePipeline, FrameReport, PipelineError};
pub use presence::{PresenceEvent, PresenceEventKind, PresenceTracker};
pub use settings::Settings;
pub use types::{BoundingBox, Detection, Embedding, Frame, Gaze, LibraryEntry, MatchResult};

use std::path::PathBuf;

/// Per-user data directory: `$XDG_DATA_HOME/presence`, else `~/.local/share/presence`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

/// Where `det_10g.onnx` and `w600k_r50.onnx` are looked up by default.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

pub fn default_db_path() -> PathBuf {
    default_data_dir().join("faces.db")
}
