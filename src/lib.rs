// src/lib.rs

pub mod analysis;
pub mod calibration;
pub mod config;
pub mod debounce;
pub mod detection;
pub mod frame_source;
pub mod pipeline;
pub mod preprocessing;
pub mod recommendation;
pub mod remote_classifier;
pub mod report;
pub mod sinks;
pub mod types;

pub use calibration::{CalibrationMapping, DepthCalibrator};
pub use pipeline::{PipelineOrchestrator, RunMode};
pub use types::{Config, Detection, Frame, Recommendation};
