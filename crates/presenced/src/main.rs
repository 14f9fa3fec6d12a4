use anyhow::{Context, Result};
use presence_core::{CancelFlag, FaceLibrary, LibrarySnapshot, Settings};
use tracing_subscriber::EnvFilter;

mod dbus_interface;
mod engine;
mod source;

use dbus_interface::{PresenceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Settings::load()?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        source = %config.source.display(),
        "configuration loaded"
    );

    let entries = FaceLibrary::open(&config.db_path)
        .and_then(|lib| lib.entries())
        .with_context(|| format!("opening face library {}", config.db_path.display()))?;
    tracing::info!(samples = entries.len(), "face library loaded");
    let library = LibrarySnapshot::new(entries);

    let cancel = CancelFlag::new();
    let (notice_tx, mut notice_rx) = tokio::sync::mpsc::unbounded_channel();
    let engine = engine::spawn_engine(&config, library.clone(), cancel.clone(), notice_tx)?;

    let service = PresenceService::new(engine.clone(), library, config.db_path.clone());
    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;
    let iface = conn
        .object_server()
        .interface::<_, PresenceService>(OBJECT_PATH)
        .await?;

    tracing::info!(bus = BUS_NAME, "presenced ready");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = notice_rx.recv() => {
                let Some(notice) = notice else {
                    tracing::error!("engine stopped unexpectedly");
                    break;
                };
                let name = notice.name.as_deref().unwrap_or_default();
                tracing::info!(name, event = notice.kind.as_str(), at_ms = notice.at_ms, "publishing presence change");
                if let Err(e) = PresenceService::presence_changed(
                    iface.signal_emitter(),
                    name,
                    notice.kind.as_str(),
                    notice.at_ms,
                )
                .await
                {
                    tracing::warn!(error = %e, "failed to emit PresenceChanged");
                }
            }
        }
    }

    tracing::info!("presenced shutting down");
    // An in-flight frame sees the flag at its next checkpoint and is dropped
    cancel.cancel();
    engine.shutdown();

    Ok(())
}
