// src/sinks.rs
//
// Output sinks for cues and annotated frames. Both are fire-and-forget from
// the frame loop: work is spawned and failures are logged, never returned.

use crate::detection::classify_density;
use crate::types::{DensityClass, Detection, Frame, Recommendation};
use ab_glyph::{FontRef, PxScale};
use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// SPEECH
// ============================================================================

pub trait SpeechSink: Send + Sync {
    /// Start speaking `text` and return immediately.
    fn speak(&self, text: &str);
}

/// Logs cues instead of voicing them.
pub struct ConsoleSpeech;

impl SpeechSink for ConsoleSpeech {
    fn speak(&self, text: &str) {
        info!("[VOICE] {}", text);
    }
}

/// Runs an external TTS program with the cue appended to its arguments.
/// Must be used from within a tokio runtime.
pub struct CommandSpeech {
    program: String,
    args: Vec<String>,
}

impl CommandSpeech {
    /// `argv[0]` is the program; `None` for an empty argv.
    pub fn new(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl SpeechSink for CommandSpeech {
    fn speak(&self, text: &str) {
        let spawned = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .kill_on_drop(false)
            .spawn();

        match spawned {
            Ok(mut child) => {
                let program = self.program.clone();
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) if !status.success() => {
                            warn!("TTS command {} exited with {}", program, status)
                        }
                        Err(e) => warn!("TTS command {} failed: {}", program, e),
                        Ok(_) => {}
                    }
                });
            }
            Err(e) => {
                warn!("Could not start TTS command {}: {}", self.program, e);
                info!("[VOICE] {}", text);
            }
        }
    }
}

pub fn speech_from_argv(argv: Option<&[String]>) -> Box<dyn SpeechSink> {
    match argv.and_then(CommandSpeech::new) {
        Some(cmd) => {
            info!("✓ Speech via {}", cmd.program);
            Box::new(cmd)
        }
        None => Box::new(ConsoleSpeech),
    }
}

// ============================================================================
// OVERLAY
// ============================================================================

#[async_trait]
pub trait OverlaySink: Send + Sync {
    /// `labels[i]` is the caption for `detections[i]`.
    fn render(
        &self,
        frame: &Frame,
        detections: &[Detection],
        labels: &[String],
        recommendation: Option<&Recommendation>,
    );

    /// Wait for any queued renders to finish.
    async fn flush(&self) {}
}

pub struct NullOverlay;

#[async_trait]
impl OverlaySink for NullOverlay {
    fn render(&self, _: &Frame, _: &[Detection], _: &[String], _: Option<&Recommendation>) {}
}

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
const ORANGE: Rgb<u8> = Rgb([255, 165, 0]);
const CUE_BAR: Rgb<u8> = Rgb([0, 255, 255]);

static FONT_DATA: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");
const LABEL_SCALE: f32 = 14.0;
const CUE_TEXT_Y: i32 = 6;

fn overlay_font() -> Option<FontRef<'static>> {
    match FontRef::try_from_slice(FONT_DATA) {
        Ok(font) => Some(font),
        Err(e) => {
            warn!("Overlay font unusable, drawing without text: {}", e);
            None
        }
    }
}

pub fn density_color(class: DensityClass) -> Rgb<u8> {
    match class {
        DensityClass::Dense => GREEN,
        DensityClass::Moderate => YELLOW,
        DensityClass::Sparse => ORANGE,
    }
}

/// Boxes coloured by density class plus a full-width depth line at each
/// mark's `mid_y`, captioned with its label just above the box. A cue is
/// flagged by a bar along the top edge with the cue text beneath it.
pub fn annotate(
    frame: &Frame,
    detections: &[Detection],
    labels: &[String],
    recommendation: Option<&Recommendation>,
    density_threshold: f64,
) -> RgbImage {
    let mut canvas = frame.image.to_rgb8();
    let width = canvas.width();
    let scale = PxScale::from(LABEL_SCALE);

    if let Some(font) = overlay_font() {
        for (det, label) in detections.iter().zip(labels) {
            let color = density_color(classify_density(det.density, density_threshold));
            let y = det.bbox.y as i32 - LABEL_SCALE as i32 - 2;
            let x = det.bbox.x as i32;
            draw_text_mut(&mut canvas, color, x, y.max(0), scale, &font, label);
        }
        if let Some(rec) = recommendation {
            draw_text_mut(&mut canvas, CUE_BAR, 4, CUE_TEXT_Y, scale, &font, &rec.text);
        }
    }

    for det in detections {
        let color = density_color(classify_density(det.density, density_threshold));
        let b = det.bbox;
        if b.w > 0 && b.h > 0 {
            draw_hollow_rect_mut(
                &mut canvas,
                Rect::at(b.x as i32, b.y as i32).of_size(b.w, b.h),
                color,
            );
            if b.w > 2 && b.h > 2 {
                draw_hollow_rect_mut(
                    &mut canvas,
                    Rect::at(b.x as i32 + 1, b.y as i32 + 1).of_size(b.w - 2, b.h - 2),
                    color,
                );
            }
        }

        let y = det.mid_y() as f32;
        draw_line_segment_mut(&mut canvas, (0.0, y), (width as f32 - 1.0, y), color);
    }

    if recommendation.is_some() {
        for y in 0..canvas.height().min(4) {
            draw_line_segment_mut(
                &mut canvas,
                (0.0, y as f32),
                (width as f32 - 1.0, y as f32),
                CUE_BAR,
            );
        }
    }

    canvas
}

/// Writes `frame_{index:06}.png` files into a directory on blocking tasks.
pub struct AnnotatedFrameWriter {
    dir: PathBuf,
    density_threshold: f64,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl AnnotatedFrameWriter {
    pub fn new(dir: impl Into<PathBuf>, density_threshold: f64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(Self {
            dir,
            density_threshold,
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn path_for(&self, index: u64) -> PathBuf {
        self.dir.join(format!("frame_{:06}.png", index))
    }
}

#[async_trait]
impl OverlaySink for AnnotatedFrameWriter {
    fn render(
        &self,
        frame: &Frame,
        detections: &[Detection],
        labels: &[String],
        recommendation: Option<&Recommendation>,
    ) {
        let frame = frame.clone();
        let detections = detections.to_vec();
        let labels = labels.to_vec();
        let recommendation = recommendation.cloned();
        let threshold = self.density_threshold;
        let path = self.path_for(frame.index);

        let handle = tokio::task::spawn_blocking(move || {
            let canvas = annotate(
                &frame,
                &detections,
                &labels,
                recommendation.as_ref(),
                threshold,
            );
            match canvas.save(&path) {
                Ok(()) => debug!("Overlay written to {}", path.display()),
                Err(e) => warn!("Failed to write overlay {}: {}", path.display(), e),
            }
        });

        if let Ok(mut pending) = self.pending.lock() {
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
        }
    }

    async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Overlay task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use chrono::Utc;
    use image::DynamicImage;

    fn detection(density: f64) -> Detection {
        Detection {
            bbox: BoundingBox::new(10, 20, 30, 20),
            area: 600.0,
            density,
            tightness: 0.8,
            centroid: (25.0, 30.0),
        }
    }

    fn frame() -> Frame {
        Frame::new(7, 0.0, DynamicImage::new_rgb8(100, 80))
    }

    #[test]
    fn test_annotate_colours_by_density() {
        let canvas = annotate(&frame(), &[detection(200.0)], &[], None, 140.0);
        assert_eq!(*canvas.get_pixel(10, 20), GREEN);
        // Depth line at mid_y = 30 spans the frame
        assert_eq!(*canvas.get_pixel(99, 30), GREEN);
        assert_eq!(*canvas.get_pixel(0, 0), Rgb([0, 0, 0]));

        let canvas = annotate(&frame(), &[detection(110.0)], &[], None, 140.0);
        assert_eq!(*canvas.get_pixel(10, 20), YELLOW);
        let canvas = annotate(&frame(), &[detection(50.0)], &[], None, 140.0);
        assert_eq!(*canvas.get_pixel(10, 20), ORANGE);
    }

    fn lit_pixels(canvas: &RgbImage, xs: std::ops::Range<u32>, ys: std::ops::Range<u32>) -> usize {
        ys.flat_map(|y| xs.clone().map(move |x| (x, y)))
            .filter(|&(x, y)| *canvas.get_pixel(x, y) != Rgb([0, 0, 0]))
            .count()
    }

    #[test]
    fn test_overlay_font_loads() {
        assert!(overlay_font().is_some());
    }

    #[test]
    fn test_annotate_captions_marks() {
        let bare = annotate(&frame(), &[detection(200.0)], &[], None, 140.0);
        assert_eq!(lit_pixels(&bare, 10..100, 0..18), 0);

        let label = "12ft | Small | Dense".to_string();
        let captioned = annotate(&frame(), &[detection(200.0)], &[label], None, 140.0);
        assert!(lit_pixels(&captioned, 10..100, 0..18) > 10);
        // Caption sits above the box; the box corner is untouched.
        assert_eq!(*captioned.get_pixel(10, 20), GREEN);
    }

    #[test]
    fn test_annotate_flags_cue() {
        let rec = Recommendation {
            text: "Small mark at 12 feet. Worth checking.".into(),
            emitted_at: Utc::now(),
            confidence: 0.5,
            depth_ft: Some(12.0),
            size: None,
            density_class: None,
            track_id: None,
            depth_trend_ft_per_frame: None,
        };
        let canvas = annotate(&frame(), &[], &[], Some(&rec), 140.0);
        assert_eq!(*canvas.get_pixel(50, 0), CUE_BAR);
        // Cue text is printed under the bar.
        assert!(lit_pixels(&canvas, 0..100, 5..24) > 10);

        let quiet = annotate(&frame(), &[], &[], None, 140.0);
        assert_eq!(lit_pixels(&quiet, 0..100, 0..24), 0);
    }

    #[tokio::test]
    async fn test_writer_saves_png() {
        let dir = tempfile::tempdir().unwrap();
        let writer = AnnotatedFrameWriter::new(dir.path().join("overlays"), 140.0).unwrap();
        let labels = vec!["12ft | Small | Dense".to_string()];
        writer.render(&frame(), &[detection(200.0)], &labels, None);
        writer.flush().await;

        let saved = image::open(writer.path_for(7)).unwrap();
        assert_eq!(saved.width(), 100);
    }

    #[test]
    fn test_command_speech_requires_program() {
        assert!(CommandSpeech::new(&[]).is_none());
        let cmd = CommandSpeech::new(&["say".to_string(), "-v".to_string(), "Alex".to_string()]).unwrap();
        assert_eq!(cmd.program, "say");
        assert_eq!(cmd.args, vec!["-v", "Alex"]);
    }
}
