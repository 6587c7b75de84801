// src/pipeline/metrics.rs
//
// Run counters. Cheap to clone and share; logged as a summary at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_frames: Arc<AtomicU64>,
    pub skipped_frames: Arc<AtomicU64>,
    pub frames_with_detections: Arc<AtomicU64>,
    pub total_detections: Arc<AtomicU64>,
    pub classifier_queries: Arc<AtomicU64>,
    pub classifier_failures: Arc<AtomicU64>,
    pub recommendations: Arc<AtomicU64>,
    pub cues_spoken: Arc<AtomicU64>,
    pub cues_suppressed: Arc<AtomicU64>,
    pub frame_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            total_frames: Arc::new(AtomicU64::new(0)),
            skipped_frames: Arc::new(AtomicU64::new(0)),
            frames_with_detections: Arc::new(AtomicU64::new(0)),
            total_detections: Arc::new(AtomicU64::new(0)),
            classifier_queries: Arc::new(AtomicU64::new(0)),
            classifier_failures: Arc::new(AtomicU64::new(0)),
            recommendations: Arc::new(AtomicU64::new(0)),
            cues_spoken: Arc::new(AtomicU64::new(0)),
            cues_suppressed: Arc::new(AtomicU64::new(0)),
            frame_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_timing(&self, counter: &AtomicU64, duration_us: u64) {
        counter.store(duration_us, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.total_frames.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_frames: self.total_frames.load(Ordering::Relaxed),
            skipped_frames: self.skipped_frames.load(Ordering::Relaxed),
            frames_with_detections: self.frames_with_detections.load(Ordering::Relaxed),
            total_detections: self.total_detections.load(Ordering::Relaxed),
            fps: self.fps(),
            classifier_queries: self.classifier_queries.load(Ordering::Relaxed),
            classifier_failures: self.classifier_failures.load(Ordering::Relaxed),
            recommendations: self.recommendations.load(Ordering::Relaxed),
            cues_spoken: self.cues_spoken.load(Ordering::Relaxed),
            cues_suppressed: self.cues_suppressed.load(Ordering::Relaxed),
            last_frame_us: self.frame_time_us.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub total_frames: u64,
    pub skipped_frames: u64,
    pub frames_with_detections: u64,
    pub total_detections: u64,
    pub fps: f64,
    pub classifier_queries: u64,
    pub classifier_failures: u64,
    pub recommendations: u64,
    pub cues_spoken: u64,
    pub cues_suppressed: u64,
    pub last_frame_us: u64,
    pub elapsed_secs: f64,
}
