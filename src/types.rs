// src/types.rs

use crate::calibration::CalibrationMapping;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub cv: CvConfig,
    pub tracking: TrackingConfig,
    pub classifier: ClassifierConfig,
    pub speech: SpeechConfig,
    pub decision: DecisionConfig,
    pub depth_map: CalibrationMapping,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub target_fps: f64,
    /// Region of interest `[x, y, w, h]` cropped from every frame.
    pub roi: Option<[u32; 4]>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_fps: 10.0,
            roi: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CvConfig {
    pub blur_kernel: u32,
    pub clahe_clip_limit: f32,
    pub clahe_grid_size: u32,
    pub bin_block: u32,
    pub bin_c: f32,
    pub morph_radius: u8,
    pub close_iterations: u8,
    pub open_iterations: u8,
    pub area_min: f64,
    pub area_max: f64,
    pub aspect_ratio_max: f64,
    pub density_thr: f64,
    pub merge_distance: f64,
}

impl Default for CvConfig {
    fn default() -> Self {
        Self {
            blur_kernel: 5,
            clahe_clip_limit: 2.0,
            clahe_grid_size: 8,
            bin_block: 21,
            bin_c: -5.0,
            morph_radius: 1,
            close_iterations: 2,
            open_iterations: 1,
            area_min: 40.0,
            area_max: 20000.0,
            aspect_ratio_max: 5.0,
            density_thr: 140.0,
            merge_distance: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub max_disappeared: u32,
    pub max_distance: f64,
    pub history_len: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_disappeared: 5,
            max_distance: 50.0,
            history_len: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub use_classifier: bool,
    pub endpoint: String,
    pub model_id: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_sec: f64,
    pub sample_rate_hz: f64,
    pub ambiguity_threshold: f64,
    pub max_image_size: u32,
    pub jpeg_quality: u8,
    /// Frame rate used for sampling when neither the source nor the
    /// measured loop rate is known yet.
    pub assumed_fps: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            use_classifier: true,
            endpoint: "https://api.groq.com/openai/v1/chat/completions".to_string(),
            model_id: "llama-3.2-90b-vision-preview".to_string(),
            api_key_env: "GROQ_API_KEY".to_string(),
            timeout_sec: 10.0,
            sample_rate_hz: 1.0,
            ambiguity_threshold: 0.5,
            max_image_size: 512,
            jpeg_quality: 85,
            assumed_fps: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub debounce_sec: f64,
    pub similarity_threshold: f64,
    pub min_confidence: f64,
    /// External TTS program and leading arguments; the cue text is appended.
    pub command: Option<Vec<String>>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            debounce_sec: 2.5,
            similarity_threshold: 0.8,
            min_confidence: 0.3,
            command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub tight_school_compactness: f64,
    pub dismiss_confidence: f32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            tight_school_compactness: 0.7,
            dismiss_confidence: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: String,
    pub save_annotated: bool,
    pub write_report: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: "output".to_string(),
            save_annotated: false,
            write_report: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "sonar_assist=info".to_string(),
        }
    }
}

// ============================================================================
// FRAMES AND DETECTIONS
// ============================================================================

/// One captured frame. `index` starts at 1 for file sources.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub timestamp_ms: f64,
    pub image: DynamicImage,
}

impl Frame {
    pub fn new(index: u64, timestamp_ms: f64, image: DynamicImage) -> Self {
        Self {
            index,
            timestamp_ms,
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Crop to `[x, y, w, h]`, clamped to the frame. Returns `None` when the
    /// clamped region is empty.
    pub fn cropped(&self, roi: [u32; 4]) -> Option<Frame> {
        let [x, y, w, h] = roi;
        if x >= self.width() || y >= self.height() {
            return None;
        }
        let w = w.min(self.width() - x);
        let h = h.min(self.height() - y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(Frame {
            index: self.index,
            timestamp_ms: self.timestamp_ms,
            image: self.image.crop_imm(x, y, w, h),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn right(&self) -> u32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.h
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.w as f64 / 2.0,
            self.y as f64 + self.h as f64 / 2.0,
        )
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        BoundingBox {
            x,
            y,
            w: self.right().max(other.right()) - x,
            h: self.bottom().max(other.bottom()) - y,
        }
    }

    /// `max(w,h) / min(w,h)`; infinite for degenerate boxes.
    pub fn aspect_ratio(&self) -> f64 {
        let long = self.w.max(self.h) as f64;
        let short = self.w.min(self.h) as f64;
        if short > 0.0 {
            long / short
        } else {
            f64::INFINITY
        }
    }
}

/// A candidate fish or school region from a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Pixel count enclosed by the outer contour.
    pub area: f64,
    /// Mean intensity (0-255) inside the region.
    pub density: f64,
    /// Circularity `4π·area/perimeter²`.
    pub tightness: f64,
    pub centroid: (f64, f64),
}

impl Detection {
    /// Vertical midpoint of the bounding box; the row used for depth lookups.
    pub fn mid_y(&self) -> u32 {
        self.bbox.y + self.bbox.h / 2
    }

    /// Local detection confidence: `tightness × density/255`.
    pub fn confidence(&self) -> f64 {
        self.tightness * (self.density / 255.0)
    }
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationLabel {
    School,
    Debris,
    Thermocline,
    Unknown,
}

impl ClassificationLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::School => "school",
            Self::Debris => "debris",
            Self::Thermocline => "thermocline",
            Self::Unknown => "unknown",
        }
    }

    /// Case-insensitive parse; anything outside the four labels is `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "school" => Some(Self::School),
            "debris" => Some(Self::Debris),
            "thermocline" => Some(Self::Thermocline),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Labels that justify dismissing a mark instead of fishing it.
    pub fn is_dismissive(&self) -> bool {
        matches!(self, Self::Debris | Self::Thermocline)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: ClassificationLabel,
    pub confidence: f32,
    pub reasoning: String,
}

impl ClassificationResult {
    pub fn unknown(reasoning: impl Into<String>) -> Self {
        Self {
            label: ClassificationLabel::Unknown,
            confidence: 0.0,
            reasoning: reasoning.into(),
        }
    }
}

// ============================================================================
// RECOMMENDATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchoolSize {
    Small,
    Medium,
    Large,
}

impl SchoolSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DensityClass {
    Sparse,
    Moderate,
    Dense,
}

impl DensityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sparse => "sparse",
            Self::Moderate => "moderate",
            Self::Dense => "dense",
        }
    }

    pub fn capitalized(&self) -> &'static str {
        match self {
            Self::Sparse => "Sparse",
            Self::Moderate => "Moderate",
            Self::Dense => "Dense",
        }
    }
}

/// An actionable cue for the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub text: String,
    pub emitted_at: DateTime<Utc>,
    /// Confidence of the detection behind the cue, or of the classifier
    /// verdict for dismissive cues.
    pub confidence: f64,
    pub depth_ft: Option<f64>,
    pub size: Option<SchoolSize>,
    pub density_class: Option<DensityClass>,
    pub track_id: Option<u64>,
    /// Positive when the mark is getting deeper.
    pub depth_trend_ft_per_frame: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: u32, y: u32, w: u32, h: u32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x, y, w, h),
            area: 1200.0,
            density: 150.0,
            tightness: 0.8,
            centroid: (25.0, 40.0),
        }
    }

    #[test]
    fn test_detection_mid_y() {
        let d = det(10, 20, 30, 40);
        assert_eq!(d.mid_y(), 40);
        assert_eq!(det(0, 5, 4, 3).mid_y(), 6);
    }

    #[test]
    fn test_detection_confidence() {
        let d = det(0, 0, 10, 10);
        assert!((d.confidence() - 0.8 * 150.0 / 255.0).abs() < 1e-9);
    }

    #[test]
    fn test_bbox_union_and_aspect() {
        let a = BoundingBox::new(10, 10, 20, 20);
        let b = BoundingBox::new(25, 15, 20, 20);
        let u = a.union(&b);
        assert_eq!(u, BoundingBox::new(10, 10, 35, 25));
        assert!((BoundingBox::new(0, 0, 50, 10).aspect_ratio() - 5.0).abs() < 1e-9);
        assert!(BoundingBox::new(0, 0, 0, 10).aspect_ratio().is_infinite());
    }

    #[test]
    fn test_label_parse() {
        assert_eq!(
            ClassificationLabel::parse(" Thermocline "),
            Some(ClassificationLabel::Thermocline)
        );
        assert_eq!(ClassificationLabel::parse("whale"), None);
        assert!(ClassificationLabel::Debris.is_dismissive());
        assert!(!ClassificationLabel::School.is_dismissive());
    }

    #[test]
    fn test_frame_crop_is_clamped() {
        let frame = Frame::new(1, 0.0, DynamicImage::new_luma8(100, 80));
        let cropped = frame.cropped([90, 70, 50, 50]).unwrap();
        assert_eq!((cropped.width(), cropped.height()), (10, 10));
        assert!(frame.cropped([100, 0, 5, 5]).is_none());
    }
}
