// src/pipeline/orchestrator.rs
//
// Single-owner frame loop:
//
//   Frame → ROI crop → preprocess → detect → cluster → track
//         → (sample → remote classify) → recommend → debounce → speech
//         → overlay
//
// Tracker and debouncer state live here and are only touched by this loop.
// Frames are read on a blocking task; classifier calls run on their own
// task and are abandoned if shutdown is requested while waiting.

use crate::analysis::{CentroidTracker, SamplingPolicy};
use crate::calibration::DepthCalibrator;
use crate::config::{duration_from_secs, DEFAULT_CLASSIFIER_TIMEOUT};
use crate::debounce::Debouncer;
use crate::detection::{cluster_detections, detect, BlobParams};
use crate::frame_source::{spawn_frame_reader, FrameEvent, FrameSource};
use crate::pipeline::{FrameContext, PipelineMetrics};
use crate::preprocessing::{preprocess, PreprocessParams};
use crate::recommendation::{best_detection, RecommendationEngine, RecommendationParams};
use crate::remote_classifier::{
    or_unknown, spawn_classification, ClassificationRequest, RemoteClassifier,
};
use crate::sinks::{NullOverlay, OverlaySink, SpeechSink};
use crate::types::{ClassificationResult, Config, Frame};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const FRAME_CHANNEL_CAPACITY: usize = 4;
/// Smoothing factor for the measured loop rate.
const FPS_ALPHA: f64 = 0.2;

/// How the loop is driven.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunMode {
    /// As fast as frames arrive.
    Batch,
    /// At most `fps` frames per second.
    Paced { fps: f64 },
}

impl RunMode {
    /// Tick period for paced runs. Rates too high or too low to give a
    /// non-zero period run unpaced.
    fn frame_period(&self) -> Option<Duration> {
        match *self {
            RunMode::Paced { fps } if fps > 0.0 => Duration::try_from_secs_f64(1.0 / fps)
                .ok()
                .filter(|period| !period.is_zero()),
            _ => None,
        }
    }
}

pub struct PipelineOrchestrator {
    config: Config,
    preprocess_params: PreprocessParams,
    blob_params: BlobParams,

    tracker: CentroidTracker,
    sampling: SamplingPolicy,
    classifier: Arc<dyn RemoteClassifier>,
    classifier_timeout: Duration,
    engine: RecommendationEngine,
    debouncer: Debouncer,

    speech: Option<Box<dyn SpeechSink>>,
    overlay: Box<dyn OverlaySink>,
    metrics: PipelineMetrics,

    shutdown: watch::Receiver<bool>,
    /// Source rate when known, otherwise the measured loop rate.
    nominal_fps: Option<f64>,
    measured_fps: Option<f64>,
    last_frame_at: Option<Instant>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: Config,
        classifier: Arc<dyn RemoteClassifier>,
        calibrator: DepthCalibrator,
    ) -> Self {
        let sampling = SamplingPolicy::from_config(&config.classifier, classifier.is_available());
        if !sampling.is_enabled() {
            info!("Remote classifier off; local detection only");
        }
        let (_tx, shutdown) = watch::channel(false);

        Self {
            preprocess_params: PreprocessParams::from(&config.cv),
            blob_params: BlobParams::from(&config.cv),
            tracker: CentroidTracker::new(config.tracking.clone()),
            sampling,
            classifier,
            classifier_timeout: duration_from_secs(
                config.classifier.timeout_sec.max(0.1),
                DEFAULT_CLASSIFIER_TIMEOUT,
            ),
            engine: RecommendationEngine::new(RecommendationParams::from(&config), calibrator),
            debouncer: Debouncer::from_config(&config.speech),
            speech: None,
            overlay: Box::new(NullOverlay),
            metrics: PipelineMetrics::new(),
            shutdown,
            nominal_fps: None,
            measured_fps: None,
            last_frame_at: None,
            config,
        }
    }

    pub fn with_speech(mut self, speech: Box<dyn SpeechSink>) -> Self {
        self.speech = Some(speech);
        self
    }

    pub fn with_overlay(mut self, overlay: Box<dyn OverlaySink>) -> Self {
        self.overlay = overlay;
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn set_nominal_fps(&mut self, fps: Option<f64>) {
        self.nominal_fps = fps.filter(|f| f.is_finite() && *f > 0.0);
    }

    /// Rate used for classifier sampling.
    pub fn effective_fps(&self) -> f64 {
        self.nominal_fps
            .or(self.measured_fps)
            .unwrap_or(self.config.classifier.assumed_fps)
    }

    // ========================================================================
    // PER-FRAME
    // ========================================================================

    /// Run one frame through the whole chain. Returns `None` when the frame
    /// has nothing usable (e.g. the ROI falls outside it).
    pub async fn process_frame(&mut self, frame: Frame) -> Option<FrameContext> {
        let started = Instant::now();
        self.update_measured_fps(started);

        let frame = match self.config.capture.roi {
            Some(roi) => match frame.cropped(roi) {
                Some(cropped) => cropped,
                None => {
                    warn!("ROI {:?} outside frame {}; skipping", roi, frame.index);
                    self.metrics.inc(&self.metrics.skipped_frames);
                    return None;
                }
            },
            None => frame,
        };

        let mut ctx = FrameContext::new(frame.index, frame.timestamp_ms);

        let gray = preprocess(&frame.image, &self.preprocess_params);
        let raw = detect(&gray, &self.blob_params);
        ctx.detections = cluster_detections(&raw, self.config.cv.merge_distance);
        ctx.tracks = self.tracker.update(&ctx.detections);

        ctx.classification = self.maybe_classify(&frame, &ctx).await;

        ctx.recommendation = self.engine.recommend(
            &ctx.detections,
            &self.tracker,
            ctx.classification.as_ref(),
        );

        if let Some(rec) = &ctx.recommendation {
            self.metrics.inc(&self.metrics.recommendations);
            if let Some(speech) = &self.speech {
                if self.debouncer.should_speak(&rec.text) {
                    speech.speak(&rec.text);
                    ctx.spoken = true;
                    self.metrics.inc(&self.metrics.cues_spoken);
                } else {
                    self.metrics.inc(&self.metrics.cues_suppressed);
                }
            }
        }

        let labels: Vec<String> = ctx
            .detections
            .iter()
            .map(|det| self.engine.describe(det))
            .collect();
        self.overlay.render(
            &frame,
            &ctx.detections,
            &labels,
            ctx.recommendation.as_ref(),
        );

        ctx.processing_us = started.elapsed().as_micros() as u64;
        self.metrics.inc(&self.metrics.total_frames);
        self.metrics
            .add(&self.metrics.total_detections, ctx.detections.len() as u64);
        if ctx.has_detections() {
            self.metrics.inc(&self.metrics.frames_with_detections);
        }
        self.metrics
            .set_timing(&self.metrics.frame_time_us, ctx.processing_us);

        debug!(
            "Frame {}: {} raw, {} clustered, {} tracks, cue={:?} ({}µs)",
            ctx.frame_index,
            raw.len(),
            ctx.detections.len(),
            ctx.tracks.len(),
            ctx.recommendation_text(),
            ctx.processing_us
        );

        Some(ctx)
    }

    async fn maybe_classify(
        &mut self,
        frame: &Frame,
        ctx: &FrameContext,
    ) -> Option<ClassificationResult> {
        if ctx.detections.is_empty() {
            return None;
        }

        let local_confidence = best_detection(&ctx.detections).map(|d| d.confidence());
        let fps = self.effective_fps();
        if !self.sampling.should_query(
            frame.index,
            self.config.classifier.sample_rate_hz,
            fps,
            local_confidence,
        ) {
            return None;
        }

        self.metrics.inc(&self.metrics.classifier_queries);
        let request = ClassificationRequest::for_detections(frame.index, &frame.image, &ctx.detections);
        let mut handle =
            spawn_classification(self.classifier.clone(), request, self.classifier_timeout);

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            joined = &mut handle => match joined {
                Ok(outcome) => {
                    if outcome.is_err() {
                        self.metrics.inc(&self.metrics.classifier_failures);
                    }
                    Some(or_unknown(outcome))
                }
                Err(e) => {
                    warn!("Classifier task failed: {}", e);
                    self.metrics.inc(&self.metrics.classifier_failures);
                    Some(ClassificationResult::unknown("Classifier task failed"))
                }
            },
            _ = shutdown_requested(&mut shutdown) => {
                debug!("Abandoning in-flight classification for frame {}", frame.index);
                handle.abort();
                None
            }
        }
    }

    fn update_measured_fps(&mut self, now: Instant) {
        if let Some(last) = self.last_frame_at {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let instant = 1.0 / dt;
                self.measured_fps = Some(match self.measured_fps {
                    Some(prev) => prev + FPS_ALPHA * (instant - prev),
                    None => instant,
                });
            }
        }
        self.last_frame_at = Some(now);
    }

    // ========================================================================
    // LOOP
    // ========================================================================

    /// Drive `source` until it ends or shutdown is requested. Each processed
    /// frame is handed to `on_frame`.
    pub async fn run<F>(
        &mut self,
        source: Box<dyn FrameSource>,
        mode: RunMode,
        mut on_frame: F,
    ) -> Result<()>
    where
        F: FnMut(FrameContext),
    {
        info!("▶ Processing {}", source.describe());
        if self.nominal_fps.is_none() && mode == RunMode::Batch {
            self.set_nominal_fps(source.nominal_fps());
        }

        let (mut frames, reader) =
            spawn_frame_reader(source, FRAME_CHANNEL_CAPACITY, self.shutdown.clone());

        let mut ticker = mode.frame_period().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                info!("Stop requested; finishing at frame boundary");
                break;
            }

            if let Some(interval) = ticker.as_mut() {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_requested(&mut shutdown) => continue,
                }
            }

            let event = tokio::select! {
                event = frames.recv() => event,
                _ = shutdown_requested(&mut shutdown) => continue,
            };

            match event {
                Some(FrameEvent::Frame(frame)) => {
                    if let Some(ctx) = self.process_frame(frame).await {
                        on_frame(ctx);
                    }
                }
                Some(FrameEvent::Unavailable) => {
                    self.metrics.inc(&self.metrics.skipped_frames);
                }
                Some(FrameEvent::EndOfStream) | None => break,
            }
        }

        drop(frames);
        self.overlay.flush().await;

        reader.await.context("Frame reader panicked")??;

        let summary = self.metrics.summary();
        info!(
            "✓ Done: {} frames ({} skipped), {} with detections, {} cues spoken, {} suppressed, {} classifier queries ({} failed), {:.1} FPS",
            summary.total_frames,
            summary.skipped_frames,
            summary.frames_with_detections,
            summary.cues_spoken,
            summary.cues_suppressed,
            summary.classifier_queries,
            summary.classifier_failures,
            summary.fps
        );
        if self.sampling.is_enabled() {
            let stats = self.sampling.get_stats();
            info!(
                "   Classifier sampling: {}/{} frames ({} ambiguous, {:.1}%)",
                stats.invocations,
                stats.total_frames,
                stats.ambiguous_invocations,
                stats.frequency * 100.0
            );
        }
        Ok(())
    }
}

/// Resolves once `rx` reads `true`. Never resolves if the sender is gone.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
