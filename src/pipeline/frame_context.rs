// src/pipeline/frame_context.rs
//
// Everything produced for one frame. Built by the orchestrator, then handed
// to the sinks and the batch report.

use crate::types::{ClassificationResult, Detection, Recommendation};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct FrameContext {
    pub frame_index: u64,
    pub timestamp_ms: f64,

    /// Clustered detections.
    pub detections: Vec<Detection>,
    /// Live tracks after this frame's update.
    pub tracks: BTreeMap<u64, Detection>,

    pub classification: Option<ClassificationResult>,
    pub recommendation: Option<Recommendation>,
    /// Set when the recommendation passed the debouncer.
    pub spoken: bool,

    pub processing_us: u64,
}

impl FrameContext {
    pub fn new(frame_index: u64, timestamp_ms: f64) -> Self {
        Self {
            frame_index,
            timestamp_ms,
            detections: Vec::new(),
            tracks: BTreeMap::new(),
            classification: None,
            recommendation: None,
            spoken: false,
            processing_us: 0,
        }
    }

    pub fn has_detections(&self) -> bool {
        !self.detections.is_empty()
    }

    pub fn recommendation_text(&self) -> Option<&str> {
        self.recommendation.as_ref().map(|r| r.text.as_str())
    }
}
