// src/detection/mod.rs
//
// Classical per-frame detection: segmentation, clustering, and the
// size/density buckets used for cues and overlays.

pub mod blob_detector;
pub mod clustering;
pub mod metrics;

pub use blob_detector::{adaptive_threshold, detect, BlobParams};
pub use clustering::cluster_detections;
pub use metrics::{classify_density, classify_school_size};
