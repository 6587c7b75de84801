// src/analysis/sampling_policy.rs
//
// Decides when a frame is worth sending to the remote classifier.
// Blends a fixed-rate budget with confidence-triggered queries: weak local
// detections get a second opinion even between scheduled samples.

use crate::types::ClassifierConfig;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingReason {
    /// Frame index landed on the fixed-rate schedule.
    Scheduled,
    /// Local confidence fell below the ambiguity threshold.
    Ambiguous,
}

pub struct SamplingPolicy {
    /// False when the classifier is disabled or has no credentials.
    enabled: bool,
    ambiguity_threshold: f64,

    total_frames: u64,
    invocations: u64,
    ambiguous_invocations: u64,
}

impl SamplingPolicy {
    pub fn new(enabled: bool, ambiguity_threshold: f64) -> Self {
        Self {
            enabled,
            ambiguity_threshold,
            total_frames: 0,
            invocations: 0,
            ambiguous_invocations: 0,
        }
    }

    pub fn from_config(config: &ClassifierConfig, classifier_available: bool) -> Self {
        Self::new(
            config.use_classifier && classifier_available,
            config.ambiguity_threshold,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Should `frame_index` be classified remotely?
    ///
    /// # Arguments
    /// * `target_rate_hz` - desired classifier queries per second; `<= 0` samples every frame
    /// * `measured_fps` - current frame rate of the loop
    /// * `local_confidence` - best local detection confidence, if any
    pub fn should_query(
        &mut self,
        frame_index: u64,
        target_rate_hz: f64,
        measured_fps: f64,
        local_confidence: Option<f64>,
    ) -> bool {
        self.total_frames += 1;

        let Some(reason) =
            self.decide(frame_index, target_rate_hz, measured_fps, local_confidence)
        else {
            return false;
        };

        self.invocations += 1;
        if reason == SamplingReason::Ambiguous {
            self.ambiguous_invocations += 1;
        }
        debug!(
            "🔍 Classifier sample at frame {} ({:?}, local_conf={:?})",
            frame_index, reason, local_confidence
        );
        true
    }

    /// Pure decision; no counters touched.
    pub fn decide(
        &self,
        frame_index: u64,
        target_rate_hz: f64,
        measured_fps: f64,
        local_confidence: Option<f64>,
    ) -> Option<SamplingReason> {
        if !self.enabled {
            return None;
        }

        if frames_between_samples(target_rate_hz, measured_fps)
            .map_or(true, |every| frame_index % every == 0)
        {
            return Some(SamplingReason::Scheduled);
        }

        match local_confidence {
            Some(conf) if conf < self.ambiguity_threshold => Some(SamplingReason::Ambiguous),
            _ => None,
        }
    }

    pub fn get_stats(&self) -> SamplingStats {
        SamplingStats {
            total_frames: self.total_frames,
            invocations: self.invocations,
            ambiguous_invocations: self.ambiguous_invocations,
            frequency: if self.total_frames > 0 {
                self.invocations as f64 / self.total_frames as f64
            } else {
                0.0
            },
        }
    }
}

/// `max(1, floor(fps / rate))`, or `None` (every frame) for a non-positive rate.
fn frames_between_samples(target_rate_hz: f64, measured_fps: f64) -> Option<u64> {
    if target_rate_hz <= 0.0 || !target_rate_hz.is_finite() {
        return None;
    }
    let ratio = (measured_fps / target_rate_hz).floor();
    let every = if ratio.is_finite() && ratio >= 1.0 {
        ratio as u64
    } else {
        1
    };
    Some(every)
}

#[derive(Debug, Clone)]
pub struct SamplingStats {
    pub total_frames: u64,
    pub invocations: u64,
    pub ambiguous_invocations: u64,
    pub frequency: f64,
}
