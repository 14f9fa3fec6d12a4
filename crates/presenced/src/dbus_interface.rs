use crate::engine::EngineHandle;
use presence_core::{FaceLibrary, LibrarySnapshot};
use std::path::PathBuf;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.kiosk.Presence1";
pub const OBJECT_PATH: &str = "/org/kiosk/Presence1";

/// D-Bus interface for the presence daemon.
///
/// Bus name: org.kiosk.Presence1
/// Object path: /org/kiosk/Presence1
pub struct PresenceService {
    engine: EngineHandle,
    library: LibrarySnapshot,
    db_path: PathBuf,
}

impl PresenceService {
    pub fn new(engine: EngineHandle, library: LibrarySnapshot, db_path: PathBuf) -> Self {
        Self {
            engine,
            library,
            db_path,
        }
    }
}

#[interface(name = "org.kiosk.Presence1")]
impl PresenceService {
    /// Return frame loop status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self
            .engine
            .status()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": status,
        })
        .to_string())
    }

    /// Re-read the face library from disk; returns the number of samples loaded.
    async fn reload_library(&self) -> zbus::fdo::Result<u32> {
        let path = self.db_path.clone();
        let entries = tokio::task::spawn_blocking(move || FaceLibrary::open(&path).and_then(|lib| lib.entries()))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("reload task: {e}")))?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        let count = self.library.replace(entries);
        tracing::info!(samples = count, "face library reloaded");
        self.engine.wake();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Current composition as JSON: confirmed names, whether anyone is
    /// present, the unknown-face count and the gaze target.
    async fn present(&self) -> zbus::fdo::Result<String> {
        let snapshot = self
            .engine
            .present()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&snapshot).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Emitted once per confirmed arrival and once per departure. `name` is
    /// empty for a visitor nobody recognized.
    #[zbus(signal)]
    pub async fn presence_changed(emitter: &SignalEmitter<'_>, name: &str, event: &str, at_ms: i64) -> zbus::Result<()>;
}
