// src/report.rs
//
// Batch-mode output: one record per processed frame plus a run summary,
// written as JSON.

use crate::pipeline::FrameContext;
use crate::types::{ClassificationResult, Detection};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameReport {
    pub frame_index: u64,
    pub timestamp_seconds: f64,
    pub detections: Vec<Detection>,
    pub recommendation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<ClassificationResult>,
}

impl FrameReport {
    /// `timestamp_seconds = frame_index / fps`, or the frame's own timestamp
    /// when no rate is known.
    pub fn from_context(ctx: &FrameContext, fps: Option<f64>) -> Self {
        let timestamp_seconds = match fps {
            Some(fps) if fps > 0.0 => ctx.frame_index as f64 / fps,
            _ => ctx.timestamp_ms / 1000.0,
        };
        Self {
            frame_index: ctx.frame_index,
            timestamp_seconds,
            detections: ctx.detections.clone(),
            recommendation: ctx.recommendation_text().map(str::to_string),
            classification: ctx.classification.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotableFrame {
    pub frame_index: u64,
    pub timestamp_seconds: f64,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub total_frames: usize,
    pub frames_with_detections: usize,
    pub total_detections: usize,
    pub average_detections_per_frame: f64,
    /// Frames whose cue mentions a large school.
    pub notable: Vec<NotableFrame>,
}

impl AnalysisSummary {
    pub fn from_frames(frames: &[FrameReport]) -> Self {
        let total_frames = frames.len();
        let frames_with_detections = frames.iter().filter(|f| !f.detections.is_empty()).count();
        let total_detections: usize = frames.iter().map(|f| f.detections.len()).sum();
        let average_detections_per_frame = if total_frames > 0 {
            total_detections as f64 / total_frames as f64
        } else {
            0.0
        };

        let notable = frames
            .iter()
            .filter_map(|f| {
                let text = f.recommendation.as_ref()?;
                text.to_lowercase().contains("large").then(|| NotableFrame {
                    frame_index: f.frame_index,
                    timestamp_seconds: f.timestamp_seconds,
                    recommendation: text.clone(),
                })
            })
            .collect();

        Self {
            total_frames,
            frames_with_detections,
            total_detections,
            average_detections_per_frame,
            notable,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub source: String,
    pub generated_at: DateTime<Utc>,
    pub fps: Option<f64>,
    pub frames: Vec<FrameReport>,
    pub summary: AnalysisSummary,
}

impl AnalysisReport {
    pub fn new(source: impl Into<String>, fps: Option<f64>, frames: Vec<FrameReport>) -> Self {
        let summary = AnalysisSummary::from_frames(&frames);
        Self {
            source: source.into(),
            generated_at: Utc::now(),
            fps,
            frames,
            summary,
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("✓ Report written to {}", path.display());
        Ok(())
    }

    pub fn log_summary(&self) {
        let s = &self.summary;
        info!("📊 Analysis summary for {}", self.source);
        info!("   Total frames: {}", s.total_frames);
        info!("   Frames with fish: {}", s.frames_with_detections);
        info!("   Total detections: {}", s.total_detections);
        info!(
            "   Average detections/frame: {:.2}",
            s.average_detections_per_frame
        );
        for n in &s.notable {
            info!(
                "   Frame {} ({:.1}s): {}",
                n.frame_index, n.timestamp_seconds, n.recommendation
            );
        }
    }
}
