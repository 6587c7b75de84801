// src/recommendation.rs
//
// Turns one frame's detections (plus an optional classifier verdict) into a
// short spoken cue.
//
// Decision order:
//   1. No detections               -> nothing
//   2. Confident debris/thermocline -> dismiss
//   3. Best mark = max(area × tightness)
//   4. Size + density classes
//   5. Confidence gate (tightness × density/255)
//   6. Phrase by depth, size, tightness and density

use crate::analysis::CentroidTracker;
use crate::calibration::DepthCalibrator;
use crate::detection::{classify_density, classify_school_size};
use crate::types::{
    ClassificationResult, Config, DensityClass, Detection, Recommendation, SchoolSize,
};
use chrono::Utc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RecommendationParams {
    pub density_threshold: f64,
    pub tight_compactness: f64,
    pub min_confidence: f64,
    pub dismiss_confidence: f32,
}

impl From<&Config> for RecommendationParams {
    fn from(config: &Config) -> Self {
        Self {
            density_threshold: config.cv.density_thr,
            tight_compactness: config.decision.tight_school_compactness,
            min_confidence: config.speech.min_confidence,
            dismiss_confidence: config.decision.dismiss_confidence,
        }
    }
}

impl Default for RecommendationParams {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

pub struct RecommendationEngine {
    params: RecommendationParams,
    calibrator: DepthCalibrator,
}

impl RecommendationEngine {
    pub fn new(params: RecommendationParams, calibrator: DepthCalibrator) -> Self {
        Self { params, calibrator }
    }

    /// Cue for this frame, if any. `tracker` must already have been updated
    /// with `detections`; it supplies the track id and depth trend.
    pub fn recommend(
        &self,
        detections: &[Detection],
        tracker: &CentroidTracker,
        classification: Option<&ClassificationResult>,
    ) -> Option<Recommendation> {
        if detections.is_empty() {
            return None;
        }

        if let Some(c) = classification {
            if c.label.is_dismissive() && c.confidence > self.params.dismiss_confidence {
                debug!("Dismissing marks: {} ({:.2})", c.label.as_str(), c.confidence);
                return Some(Recommendation {
                    text: format!("Likely {} - ignore for now.", c.label.as_str()),
                    emitted_at: Utc::now(),
                    confidence: c.confidence as f64,
                    depth_ft: None,
                    size: None,
                    density_class: None,
                    track_id: None,
                    depth_trend_ft_per_frame: None,
                });
            }
        }

        let best = best_detection(detections)?;
        let size = classify_school_size(best.area);
        let density = classify_density(best.density, self.params.density_threshold);

        let confidence = best.confidence();
        if confidence < self.params.min_confidence {
            debug!(
                "Best mark below confidence gate ({:.2} < {:.2})",
                confidence, self.params.min_confidence
            );
            return None;
        }

        let depth_ft = self.calibrator.pixel_to_depth(best.mid_y() as f64);
        let tight = best.tightness >= self.params.tight_compactness;
        let track_id = tracker.track_for(best);
        let depth_trend_ft_per_frame = track_id
            .and_then(|id| tracker.get_velocity(id))
            .map(|(_, dy)| dy * self.calibrator.feet_per_pixel());

        Some(Recommendation {
            text: compose_cue(depth_ft, size, density, tight),
            emitted_at: Utc::now(),
            confidence,
            depth_ft: Some(depth_ft),
            size: Some(size),
            density_class: Some(density),
            track_id,
            depth_trend_ft_per_frame,
        })
    }

    /// Overlay label for one mark: `"{depth}ft | {size} | {density}"`.
    pub fn describe(&self, det: &Detection) -> String {
        let depth = self.calibrator.pixel_to_depth(det.mid_y() as f64);
        format!(
            "{:.0}ft | {} | {}",
            depth,
            classify_school_size(det.area).as_str(),
            classify_density(det.density, self.params.density_threshold).as_str()
        )
    }
}

/// The mark maximizing `area × tightness`.
pub fn best_detection(detections: &[Detection]) -> Option<&Detection> {
    detections.iter().max_by(|a, b| {
        (a.area * a.tightness)
            .partial_cmp(&(b.area * b.tightness))
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

fn compose_cue(depth_ft: f64, size: SchoolSize, density: DensityClass, tight: bool) -> String {
    match (size, tight) {
        (SchoolSize::Large, true) => format!(
            "Large, tight school around {:.0} feet. Drop to {:.0} and hold.",
            depth_ft, depth_ft
        ),
        (SchoolSize::Medium | SchoolSize::Large, _) => format!(
            "{} near {:.0} feet. {} density. Troll through {:.0} feet.",
            if tight { "School" } else { "Scattered school" },
            depth_ft,
            density.capitalized(),
            depth_ft
        ),
        (SchoolSize::Small, _) => format!("Small mark at {:.0} feet. Worth checking.", depth_ft),
    }
}
