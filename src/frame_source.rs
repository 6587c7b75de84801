// src/frame_source.rs
//
// Frame acquisition. Sources are blocking iterators; `spawn_frame_reader`
// drives one on a blocking task and hands frames to the async loop over a
// bounded channel.

use crate::types::Frame;
use anyhow::{bail, Context, Result};
use image::DynamicImage;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tif"];
const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

#[derive(Debug, Clone)]
pub enum FrameEvent {
    Frame(Frame),
    /// Nothing usable this cycle; the loop skips it.
    Unavailable,
    EndOfStream,
}

pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<FrameEvent>;

    /// Native rate of the source, when it has one.
    fn nominal_fps(&self) -> Option<f64>;

    fn describe(&self) -> String;
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn timestamp_ms(index: u64, fps: f64) -> f64 {
    if fps > 0.0 {
        index as f64 / fps * 1000.0
    } else {
        0.0
    }
}

/// Open `path` as a frame source: a directory of images, a single image,
/// or (with the `video` feature) a video file.
pub fn open_source(path: &Path, fps: f64) -> Result<Box<dyn FrameSource>> {
    if path.is_dir() {
        return Ok(Box::new(ImageSequenceSource::open(path, fps)?));
    }
    if !path.exists() {
        bail!("Input {} does not exist", path.display());
    }
    if has_extension(path, &IMAGE_EXTENSIONS) {
        return Ok(Box::new(ImageSequenceSource::from_paths(
            vec![path.to_path_buf()],
            fps,
        )));
    }
    if has_extension(path, &VIDEO_EXTENSIONS) {
        #[cfg(feature = "video")]
        {
            return Ok(Box::new(VideoFileSource::open(path)?));
        }
        #[cfg(not(feature = "video"))]
        bail!(
            "{} is a video file; rebuild with `--features video` to decode it",
            path.display()
        );
    }
    bail!("Unsupported input {}", path.display())
}

// ============================================================================
// IMAGE SEQUENCE
// ============================================================================

pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    fps: f64,
    cursor: usize,
}

impl ImageSequenceSource {
    /// All images under `dir`, in path order.
    pub fn open(dir: &Path, fps: f64) -> Result<Self> {
        let mut paths: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && has_extension(e.path(), &IMAGE_EXTENSIONS))
            .map(|e| e.into_path())
            .collect();
        paths.sort();

        let source = Self::from_paths(paths, fps);
        if source.is_empty() {
            bail!("No image files found in {}", dir.display());
        }
        info!("Found {} frames in {}", source.len(), dir.display());
        Ok(source)
    }

    pub fn from_paths(paths: Vec<PathBuf>, fps: f64) -> Self {
        Self {
            paths,
            fps,
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<FrameEvent> {
        let Some(path) = self.paths.get(self.cursor) else {
            return Ok(FrameEvent::EndOfStream);
        };
        self.cursor += 1;
        let index = self.cursor as u64;

        match image::open(path) {
            Ok(img) => Ok(FrameEvent::Frame(Frame::new(
                index,
                timestamp_ms(index, self.fps),
                img,
            ))),
            Err(e) => {
                warn!("Skipping unreadable frame {}: {}", path.display(), e);
                Ok(FrameEvent::Unavailable)
            }
        }
    }

    fn nominal_fps(&self) -> Option<f64> {
        Some(self.fps)
    }

    fn describe(&self) -> String {
        format!("image sequence ({} frames)", self.len())
    }
}

// ============================================================================
// IN-MEMORY
// ============================================================================

/// Pre-built frames; `None` entries surface as `Unavailable`.
pub struct MemorySource {
    frames: VecDeque<Option<DynamicImage>>,
    fps: f64,
    index: u64,
}

impl MemorySource {
    pub fn new(frames: Vec<Option<DynamicImage>>, fps: f64) -> Self {
        Self {
            frames: frames.into(),
            fps,
            index: 0,
        }
    }

    pub fn from_images(images: Vec<DynamicImage>, fps: f64) -> Self {
        Self::new(images.into_iter().map(Some).collect(), fps)
    }
}

impl FrameSource for MemorySource {
    fn next_frame(&mut self) -> Result<FrameEvent> {
        let Some(slot) = self.frames.pop_front() else {
            return Ok(FrameEvent::EndOfStream);
        };
        self.index += 1;
        Ok(match slot {
            Some(img) => FrameEvent::Frame(Frame::new(
                self.index,
                timestamp_ms(self.index, self.fps),
                img,
            )),
            None => FrameEvent::Unavailable,
        })
    }

    fn nominal_fps(&self) -> Option<f64> {
        Some(self.fps)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ============================================================================
// VIDEO FILE (opencv)
// ============================================================================

#[cfg(feature = "video")]
pub struct VideoFileSource {
    cap: opencv::videoio::VideoCapture,
    path: PathBuf,
    fps: f64,
    total_frames: i64,
    current_frame: u64,
}

#[cfg(feature = "video")]
impl VideoFileSource {
    pub fn open(path: &Path) -> Result<Self> {
        use opencv::videoio::{self, VideoCapture, VideoCaptureTraitConst};

        info!("Opening video: {}", path.display());
        let name = path
            .to_str()
            .with_context(|| format!("Non UTF-8 path {}", path.display()))?;
        let cap = VideoCapture::from_file(name, videoio::CAP_ANY)?;
        if !cap.is_opened()? {
            bail!("Failed to open video file {}", path.display());
        }

        let fps = cap.get(videoio::CAP_PROP_FPS)?;
        let total_frames = cap.get(videoio::CAP_PROP_FRAME_COUNT)? as i64;
        let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
        info!(
            "Video properties: {}x{} @ {:.1} FPS, {} frames",
            width, height, fps, total_frames
        );

        Ok(Self {
            cap,
            path: path.to_path_buf(),
            fps,
            total_frames,
            current_frame: 0,
        })
    }
}

#[cfg(feature = "video")]
impl FrameSource for VideoFileSource {
    fn next_frame(&mut self) -> Result<FrameEvent> {
        use opencv::core::Mat;
        use opencv::imgproc;
        use opencv::prelude::*;
        use opencv::videoio::VideoCaptureTrait;

        let mut mat = Mat::default();
        if !self.cap.read(&mut mat)? || mat.empty() {
            return Ok(FrameEvent::EndOfStream);
        }
        self.current_frame += 1;

        let mut rgb = Mat::default();
        imgproc::cvt_color(&mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
        let (w, h) = (rgb.cols() as u32, rgb.rows() as u32);
        let data = rgb.data_bytes()?.to_vec();

        let Some(buffer) = image::RgbImage::from_raw(w, h, data) else {
            warn!("Frame {} has an unexpected layout", self.current_frame);
            return Ok(FrameEvent::Unavailable);
        };

        Ok(FrameEvent::Frame(Frame::new(
            self.current_frame,
            timestamp_ms(self.current_frame, self.fps),
            DynamicImage::ImageRgb8(buffer),
        )))
    }

    fn nominal_fps(&self) -> Option<f64> {
        (self.fps > 0.0).then_some(self.fps)
    }

    fn describe(&self) -> String {
        format!("video {} ({} frames)", self.path.display(), self.total_frames)
    }
}

// ============================================================================
// BLOCKING READER TASK
// ============================================================================

/// Pull frames from `source` on a blocking thread. The task ends after
/// `EndOfStream`, when the receiver is dropped, or once `shutdown` flips.
pub fn spawn_frame_reader(
    mut source: Box<dyn FrameSource>,
    capacity: usize,
    shutdown: watch::Receiver<bool>,
) -> (mpsc::Receiver<FrameEvent>, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let handle = tokio::task::spawn_blocking(move || -> Result<()> {
        loop {
            if *shutdown.borrow() {
                debug!("Frame reader stopping on shutdown");
                return Ok(());
            }

            let event = source.next_frame().context("Frame source failed")?;
            let done = matches!(event, FrameEvent::EndOfStream);
            if tx.blocking_send(event).is_err() {
                return Ok(());
            }
            if done {
                return Ok(());
            }
        }
    });

    (rx, handle)
}
