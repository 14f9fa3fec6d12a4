use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use presence_core::detector::ScrfdDetector;
use presence_core::pipeline::{FaceReport, Unresolved};
use presence_core::recognizer::ArcFaceRecognizer;
use presence_core::{CancelFlag, FaceLibrary, FacePipeline, Frame, Gaze, Settings};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.kiosk.Presence1",
    default_service = "org.kiosk.Presence1",
    default_path = "/org/kiosk/Presence1"
)]
trait Presence {
    async fn status(&self) -> zbus::Result<String>;
    async fn reload_library(&self) -> zbus::Result<u32>;
    async fn present(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Face identity and presence CLI")]
struct Cli {
    /// Face library database (overrides PRESENCE_DB_PATH and the config file)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Directory holding the detector and recognizer models
    #[arg(long, global = true)]
    models: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect and identify every face in an image
    Identify {
        image: PathBuf,
    },
    /// Enroll the most confident face of each image under a name
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// List enrolled face samples
    List,
    /// Remove a sample by id, or every sample of a name
    Remove {
        /// Sample ID to remove
        id: Option<String>,
        #[arg(long, conflicts_with = "id")]
        name: Option<String>,
    },
    /// Show daemon status
    Status,
    /// Names the daemon currently sees
    Present,
    /// Ask the daemon to re-read the face library
    Reload,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    // Same resolution as the daemon, so both agree on thresholds and paths
    let mut settings = Settings::load()?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    if let Some(models) = cli.models {
        settings.model_dir = models;
    }
    let db_path = settings.db_path.clone();

    match cli.command {
        Commands::Identify { image } => {
            let library = FaceLibrary::open(&db_path)?.entries()?;
            let mut pipeline = load_pipeline(&settings)?;
            let frame = load_image(&image)?;
            let (faces, inference) = pipeline.analyze(&frame, &library, &CancelFlag::new())?;
            let unknown = faces.iter().filter(|f| f.result.name.is_none()).count();
            let gaze = Gaze::toward(faces.iter().map(|f| &f.detection.bbox), frame.width, frame.height);

            let out = serde_json::json!({
                "image": image.display().to_string(),
                "inference_ms": inference.as_millis() as u64,
                "unknown_faces": unknown,
                "gaze": gaze,
                "faces": faces.iter().map(face_json).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Enroll { name, images } => {
            let library = FaceLibrary::open(&db_path)?;
            let mut pipeline = load_pipeline(&settings)?;
            let mut enrolled = 0usize;

            for path in &images {
                let frame = load_image(path)?;
                let (faces, _) = pipeline.analyze(&frame, &[], &CancelFlag::new())?;
                let best = faces
                    .into_iter()
                    .filter(|f| f.embedding.is_some())
                    .max_by(|a, b| a.detection.confidence.total_cmp(&b.detection.confidence));

                let Some(embedding) = best.and_then(|f| f.embedding) else {
                    eprintln!("{}: no usable face", path.display());
                    continue;
                };
                match library.add(&name, &embedding) {
                    Ok(id) => {
                        println!("{}: enrolled {name} ({id})", path.display());
                        enrolled += 1;
                    }
                    Err(presence_core::library::LibraryError::Duplicate { similarity, .. }) => {
                        eprintln!("{}: already enrolled (similarity {similarity:.3})", path.display());
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if enrolled == 0 {
                bail!("no samples enrolled for {name}");
            }
            notify_reload().await;
        }
        Commands::List => {
            let library = FaceLibrary::open(&db_path)?;
            let entries = library.list()?;
            if entries.is_empty() {
                println!("No faces enrolled");
            } else {
                println!("{} sample(s) of {} people", entries.len(), library.names()?.len());
            }
            for e in entries {
                println!(
                    "{}  {:<20}  {}  {}",
                    e.id,
                    e.name,
                    e.created_at.format("%Y-%m-%d %H:%M"),
                    e.model_version.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Remove { id, name } => {
            let library = FaceLibrary::open(&db_path)?;
            match (id, name) {
                (Some(id), _) => {
                    if !library.remove(&id)? {
                        bail!("no sample with id {id}");
                    }
                    println!("Removed {id}");
                }
                (None, Some(name)) => {
                    let n = library.remove_name(&name)?;
                    println!("Removed {n} sample(s) of {name}");
                }
                (None, None) => bail!("give a sample id or --name"),
            }
            notify_reload().await;
        }
        Commands::Status => {
            let proxy = connect().await?;
            println!("{}", proxy.status().await?);
        }
        Commands::Present => {
            let proxy = connect().await?;
            println!("{}", proxy.present().await?);
        }
        Commands::Reload => {
            let proxy = connect().await?;
            let n = proxy.reload_library().await?;
            println!("Daemon reloaded {n} sample(s)");
        }
    }

    Ok(())
}

fn load_pipeline(settings: &Settings) -> Result<FacePipeline<ScrfdDetector, ArcFaceRecognizer>> {
    let detector = ScrfdDetector::load(&settings.detector_path(), &settings.pipeline.detection.strides)?;
    let recognizer = ArcFaceRecognizer::load(&settings.recognizer_path())?;
    Ok(FacePipeline::new(detector, recognizer, &settings.pipeline))
}

fn load_image(path: &Path) -> Result<Frame> {
    let image = image::open(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Frame::from_image(&image))
}

fn face_json(face: &FaceReport) -> serde_json::Value {
    let unresolved = face.unresolved.as_ref().map(|u| match u {
        Unresolved::NoLandmarks => "no landmarks".to_string(),
        Unresolved::Alignment(e) => e.to_string(),
        Unresolved::InvalidEmbedding => "invalid embedding".to_string(),
    });
    serde_json::json!({
        "bbox": face.detection.bbox,
        "confidence": face.detection.confidence,
        "name": face.result.name,
        "similarity": face.result.similarity,
        "accepted": face.result.accepted,
        "candidates": face.result.candidates,
        "unresolved": unresolved,
    })
}

async fn connect() -> Result<PresenceProxy<'static>> {
    let conn = zbus::Connection::session().await.context("connecting to session bus")?;
    Ok(PresenceProxy::new(&conn).await?)
}

/// Tell a running daemon about library changes; silent when none is running.
async fn notify_reload() {
    let result = async { connect().await?.reload_library().await.map_err(anyhow::Error::from) }.await;
    match result {
        Ok(n) => tracing::info!(samples = n, "daemon library reloaded"),
        Err(e) => tracing::debug!(error = %e, "daemon not notified"),
    }
}
