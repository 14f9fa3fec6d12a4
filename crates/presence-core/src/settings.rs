//! Runtime settings shared by the daemon and the CLI.
//!
//! Resolution order: built-in defaults, then the TOML file named by
//! `PRESENCE_CONFIG`, then individual `PRESENCE_*` environment variables.

use crate::config::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub recognizer_model: String,
    /// Path to the SQLite face library.
    pub db_path: PathBuf,
    /// Snapshot image kept fresh by a capture process, or a directory of images.
    pub source: PathBuf,
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_dir: crate::default_model_dir(),
            detector_model: "det_10g.onnx".to_string(),
            recognizer_model: "w600k_r50.onnx".to_string(),
            db_path: crate::default_db_path(),
            source: runtime_dir().join("frame.jpg"),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Settings {
    /// Load from `PRESENCE_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, SettingsError> {
        let mut settings = match std::env::var_os("PRESENCE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `PRESENCE_*` variables; unparsable values keep the current setting.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("PRESENCE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("PRESENCE_SOURCE") {
            self.source = PathBuf::from(v);
        }

        let p = &mut self.pipeline;
        p.detection.confidence_threshold =
            parsed(&get, "PRESENCE_DETECTION_THRESHOLD", p.detection.confidence_threshold);
        p.matching.threshold = parsed(&get, "PRESENCE_MATCH_THRESHOLD", p.matching.threshold);
        p.matching.margin = parsed(&get, "PRESENCE_MATCH_MARGIN", p.matching.margin);
        p.presence.confirm_frames = parsed(&get, "PRESENCE_CONFIRM_FRAMES", p.presence.confirm_frames);
        p.presence.departure_ms = parsed(&get, "PRESENCE_DEPARTURE_MS", p.presence.departure_ms);
        p.presence.forget_ms = parsed(&get, "PRESENCE_FORGET_MS", p.presence.forget_ms);
        p.pacing.manual_interval_ms = parsed(&get, "PRESENCE_INTERVAL_MS", p.pacing.manual_interval_ms);
    }

    pub fn detector_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    pub fn recognizer_path(&self) -> PathBuf {
        self.model_dir.join(&self.recognizer_model)
    }
}

fn parsed<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(current)
}

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
        .join("presence")
}
