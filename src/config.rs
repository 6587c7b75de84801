// src/config.rs

use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(10);

/// Seconds from the config as a `Duration`. Negative, NaN, infinite or
/// out-of-range values give `fallback`.
pub fn duration_from_secs(secs: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(fallback)
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Config {} not found, using defaults", path.display());
            return Ok(Config::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = serde_yaml::to_string(self)?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
cv:
  area_min: 100
tracking:
  max_distance: 80
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cv.area_min, 100.0);
        assert_eq!(config.cv.bin_block, 21);
        assert_eq!(config.tracking.max_distance, 80.0);
        assert_eq!(config.tracking.max_disappeared, 5);
        assert_eq!(config.depth_map.pix_bot, 650.0);
        assert!(config.capture.roi.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = Config::default();
        config.speech.debounce_sec = 4.0;
        config.capture.roi = Some([10, 20, 300, 400]);
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.speech.debounce_sec, 4.0);
        assert_eq!(loaded.capture.roi, Some([10, 20, 300, 400]));
    }

    #[test]
    fn test_duration_from_secs() {
        let fallback = Duration::from_secs(7);
        assert_eq!(duration_from_secs(2.5, fallback), Duration::from_millis(2500));
        assert_eq!(duration_from_secs(f64::INFINITY, fallback), fallback);
        assert_eq!(duration_from_secs(f64::NAN, fallback), fallback);
        assert_eq!(duration_from_secs(-1.0, fallback), fallback);
        assert_eq!(duration_from_secs(1e300, fallback), fallback);
    }

    #[test]
    fn test_infinite_values_parse_from_yaml() {
        let yaml = "speech:\n  debounce_sec: .inf\nclassifier:\n  timeout_sec: .inf\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.speech.debounce_sec.is_infinite());
        assert!(config.classifier.timeout_sec.is_infinite());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("nope.yaml")).unwrap();
        assert_eq!(config.cv.blur_kernel, 5);
        assert!(Config::load(dir.path().join("nope.yaml")).is_err());
    }
}
