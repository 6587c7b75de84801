// src/analysis/mod.rs
//
// Cross-frame state: identity tracking and classifier sampling.
//
// Signal flow:
//   Clustered detections → centroid_tracker → track ids + velocities
//   Frame index + local confidence → sampling_policy → classifier query?

pub mod centroid_tracker;
pub mod sampling_policy;

pub use centroid_tracker::{CentroidTracker, Track};
pub use sampling_policy::{SamplingPolicy, SamplingReason, SamplingStats};
