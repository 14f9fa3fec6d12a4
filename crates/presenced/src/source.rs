//! Where frames come from.
//!
//! The daemon does not drive a camera itself: a capture process keeps a
//! snapshot image up to date, or a directory of stills is replayed.

use presence_core::Frame;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("frame source not found: {0}")]
    NotFound(PathBuf),
    #[error("no images in {0}")]
    Empty(PathBuf),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
}

pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame, SourceError>;
    fn describe(&self) -> String;
}

enum Mode {
    /// Re-read the same file every capture.
    Snapshot(PathBuf),
    /// Cycle through a fixed list of images.
    Playlist { files: Vec<PathBuf>, next: usize },
}

pub struct ImageFrameSource {
    mode: Mode,
}

impl ImageFrameSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| is_image(p))
                .collect();
            if files.is_empty() {
                return Err(SourceError::Empty(path.to_path_buf()));
            }
            files.sort();
            tracing::info!(dir = %path.display(), images = files.len(), "replaying image directory");
            Ok(Self {
                mode: Mode::Playlist { files, next: 0 },
            })
        } else if path.exists() {
            tracing::info!(path = %path.display(), "reading snapshot file");
            Ok(Self {
                mode: Mode::Snapshot(path.to_path_buf()),
            })
        } else {
            Err(SourceError::NotFound(path.to_path_buf()))
        }
    }
}

impl FrameSource for ImageFrameSource {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let path = match &mut self.mode {
            Mode::Snapshot(path) => path.clone(),
            Mode::Playlist { files, next } => {
                let path = files[*next % files.len()].clone();
                *next = (*next + 1) % files.len();
                path
            }
        };
        load_frame(&path)
    }

    fn describe(&self) -> String {
        match &self.mode {
            Mode::Snapshot(path) => format!("snapshot:{}", path.display()),
            Mode::Playlist { files, .. } => format!("playlist:{} images", files.len()),
        }
    }
}

pub fn load_frame(path: &Path) -> Result<Frame, SourceError> {
    let image = image::open(path).map_err(|source| SourceError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Frame::from_image(&image))
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("presence-src-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_png(path: &Path, w: u32, h: u32) {
        image::RgbImage::from_pixel(w, h, image::Rgb([10, 20, 30])).save(path).unwrap();
    }

    #[test]
    fn test_missing_path() {
        let err = ImageFrameSource::open(Path::new("/nonexistent/presence/frame.jpg")).err();
        assert!(matches!(err, Some(SourceError::NotFound(_))));
    }

    #[test]
    fn test_playlist_cycles_sorted() {
        let dir = scratch_dir().join("cycle");
        std::fs::create_dir_all(&dir).unwrap();
        write_png(&dir.join("b.png"), 4, 2);
        write_png(&dir.join("a.png"), 2, 2);
        std::fs::write(dir.join("notes.txt"), "skip me").unwrap();

        let mut src = ImageFrameSource::open(&dir).unwrap();
        assert_eq!(src.describe(), "playlist:2 images");
        let widths: Vec<u32> = (0..3).map(|_| src.next_frame().unwrap().width).collect();
        assert_eq!(widths, vec![2, 4, 2]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_snapshot_reread() {
        let dir = scratch_dir().join("snap");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("frame.png");
        write_png(&path, 3, 3);

        let mut src = ImageFrameSource::open(&path).unwrap();
        let frame = src.next_frame().unwrap();
        assert_eq!((frame.width, frame.height), (3, 3));
        assert_eq!(&frame.data[..3], &[10, 20, 30]);

        write_png(&path, 5, 1);
        assert_eq!(src.next_frame().unwrap().width, 5);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_empty_directory() {
        let dir = scratch_dir().join("empty");
        std::fs::create_dir_all(&dir).unwrap();
        assert!(matches!(ImageFrameSource::open(&dir), Err(SourceError::Empty(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
