// src/calibration.rs
//
// Pixel-row to depth mapping. The sonar display draws depth linearly from
// top to bottom, so two reference ticks (pixel row, depth in feet) are
// enough to map any row to a depth.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DEPTH_MAP_KEY: &str = "depth_map";

/// Two-point linear fit between screen rows and depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMapping {
    pub pix_top: f64,
    pub pix_bot: f64,
    pub ft_top: f64,
    pub ft_bot: f64,
}

impl Default for CalibrationMapping {
    fn default() -> Self {
        Self {
            pix_top: 50.0,
            pix_bot: 650.0,
            ft_top: 0.0,
            ft_bot: 100.0,
        }
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

pub trait CalibrationStore: Send + Sync {
    fn load(&self) -> Result<Option<CalibrationMapping>>;
    fn save(&self, mapping: &CalibrationMapping) -> Result<()>;
}

/// Keeps the mapping under the `depth_map` key of the YAML config file,
/// leaving every other key untouched.
pub struct YamlCalibrationStore {
    path: PathBuf,
}

impl YamlCalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Value> {
        if !self.path.exists() {
            return Ok(Value::Mapping(Mapping::new()));
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let doc: Value = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(match doc {
            Value::Null => Value::Mapping(Mapping::new()),
            other => other,
        })
    }
}

impl CalibrationStore for YamlCalibrationStore {
    fn load(&self) -> Result<Option<CalibrationMapping>> {
        let doc = self.read_document()?;
        match doc.get(DEPTH_MAP_KEY) {
            Some(section) => {
                let mapping: CalibrationMapping = serde_yaml::from_value(section.clone())
                    .context("Invalid depth_map section")?;
                Ok(Some(mapping))
            }
            None => Ok(None),
        }
    }

    fn save(&self, mapping: &CalibrationMapping) -> Result<()> {
        let mut doc = self.read_document()?;
        let root = doc
            .as_mapping_mut()
            .context("Config root is not a mapping")?;
        root.insert(
            Value::String(DEPTH_MAP_KEY.to_string()),
            serde_yaml::to_value(mapping)?,
        );

        let contents = serde_yaml::to_string(&doc)?;
        fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        info!("✓ Calibration saved to {}", self.path.display());
        Ok(())
    }
}

// ============================================================================
// CALIBRATOR
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct DepthCalibrator {
    mapping: CalibrationMapping,
}

impl DepthCalibrator {
    pub fn new(mapping: CalibrationMapping) -> Self {
        Self { mapping }
    }

    /// Load the persisted mapping, falling back to the defaults when the
    /// store is empty or unreadable.
    pub fn from_store(store: &dyn CalibrationStore) -> Self {
        match store.load() {
            Ok(Some(mapping)) => Self::new(mapping),
            Ok(None) => Self::default(),
            Err(e) => {
                warn!("Could not load calibration: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn mapping(&self) -> &CalibrationMapping {
        &self.mapping
    }

    /// Replace the fit with two reference points `(pixel_row, depth_ft)`.
    pub fn calibrate(&mut self, top: (f64, f64), bottom: (f64, f64)) -> CalibrationMapping {
        self.mapping = CalibrationMapping {
            pix_top: top.0,
            pix_bot: bottom.0,
            ft_top: top.1,
            ft_bot: bottom.1,
        };
        info!(
            "Calibration set: {:.0}px = {:.1}ft, {:.0}px = {:.1}ft",
            top.0, top.1, bottom.0, bottom.1
        );
        self.mapping
    }

    pub fn calibrate_and_save(
        &mut self,
        top: (f64, f64),
        bottom: (f64, f64),
        store: &dyn CalibrationStore,
    ) -> Result<()> {
        let mapping = self.calibrate(top, bottom);
        store.save(&mapping)
    }

    /// Depth in feet at `pixel_y`, clamped to the calibrated range.
    pub fn pixel_to_depth(&self, pixel_y: f64) -> f64 {
        let m = &self.mapping;
        if m.pix_bot == m.pix_top || m.ft_bot == m.ft_top {
            return m.ft_top;
        }

        let ratio = (pixel_y - m.pix_top) / (m.pix_bot - m.pix_top);
        let depth = m.ft_top + ratio * (m.ft_bot - m.ft_top);

        let (lo, hi) = (m.ft_top.min(m.ft_bot), m.ft_top.max(m.ft_bot));
        depth.clamp(lo, hi)
    }

    /// Pixel row for `depth_ft`. Not clamped.
    pub fn depth_to_pixel(&self, depth_ft: f64) -> f64 {
        let m = &self.mapping;
        if m.ft_bot == m.ft_top || m.pix_bot == m.pix_top {
            return m.pix_top;
        }

        let ratio = (depth_ft - m.ft_top) / (m.ft_bot - m.ft_top);
        m.pix_top + ratio * (m.pix_bot - m.pix_top)
    }

    /// `(depth_top, depth_bottom)` as configured.
    pub fn depth_range(&self) -> (f64, f64) {
        (self.mapping.ft_top, self.mapping.ft_bot)
    }

    /// Feet per pixel row; zero for a degenerate fit.
    pub fn feet_per_pixel(&self) -> f64 {
        let m = &self.mapping;
        if m.pix_bot == m.pix_top {
            return 0.0;
        }
        (m.ft_bot - m.ft_top) / (m.pix_bot - m.pix_top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn calibrator(pix_top: f64, pix_bot: f64, ft_top: f64, ft_bot: f64) -> DepthCalibrator {
        DepthCalibrator::new(CalibrationMapping {
            pix_top,
            pix_bot,
            ft_top,
            ft_bot,
        })
    }

    #[test]
    fn test_pixel_to_depth_linear_and_clamped() {
        let cal = calibrator(0.0, 100.0, 0.0, 100.0);
        assert_eq!(cal.pixel_to_depth(0.0), 0.0);
        assert_eq!(cal.pixel_to_depth(50.0), 50.0);
        assert_eq!(cal.pixel_to_depth(100.0), 100.0);
        assert_eq!(cal.pixel_to_depth(-10.0), 0.0);
        assert_eq!(cal.pixel_to_depth(200.0), 100.0);
    }

    #[test]
    fn test_offset_calibration() {
        let cal = calibrator(50.0, 650.0, 0.0, 100.0);
        assert_abs_diff_eq!(cal.pixel_to_depth(50.0), 0.0, epsilon = 0.1);
        assert_abs_diff_eq!(cal.pixel_to_depth(650.0), 100.0, epsilon = 0.1);
        assert_abs_diff_eq!(cal.pixel_to_depth(350.0), 50.0, epsilon = 1.0);
    }

    #[test]
    fn test_inverse_round_trip() {
        for cal in [
            calibrator(100.0, 700.0, 0.0, 120.0),
            calibrator(10.0, 20.0, 5.0, 400.0),
            calibrator(600.0, 40.0, 0.0, 60.0),
        ] {
            let (top, bottom) = cal.depth_range();
            let steps = 24;
            for i in 0..=steps {
                let d = top + (bottom - top) * i as f64 / steps as f64;
                let recovered = cal.pixel_to_depth(cal.depth_to_pixel(d));
                assert_abs_diff_eq!(recovered, d, epsilon = 0.5);
            }
        }
    }

    #[test]
    fn test_monotonic_and_boundary_clamp() {
        let cal = calibrator(50.0, 650.0, 10.0, 110.0);
        let mut prev = f64::NEG_INFINITY;
        for y in (-100..800).step_by(7) {
            let d = cal.pixel_to_depth(y as f64);
            assert!(d >= prev);
            prev = d;
        }
        assert_eq!(cal.pixel_to_depth(-500.0), 10.0);
        assert_eq!(cal.pixel_to_depth(5000.0), 110.0);
    }

    #[test]
    fn test_inverted_depth_range_clamps_to_min_max() {
        let cal = calibrator(0.0, 100.0, 100.0, 0.0);
        assert_eq!(cal.pixel_to_depth(-50.0), 100.0);
        assert_eq!(cal.pixel_to_depth(150.0), 0.0);
        assert_abs_diff_eq!(cal.pixel_to_depth(25.0), 75.0, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_calibration_returns_top() {
        let same_pixels = calibrator(300.0, 300.0, 10.0, 90.0);
        assert_eq!(same_pixels.pixel_to_depth(123.0), 10.0);
        assert_eq!(same_pixels.depth_to_pixel(50.0), 300.0);
        assert_eq!(same_pixels.feet_per_pixel(), 0.0);

        let same_depths = calibrator(50.0, 650.0, 40.0, 40.0);
        assert_eq!(same_depths.pixel_to_depth(600.0), 40.0);
        assert_eq!(same_depths.depth_to_pixel(70.0), 50.0);
    }

    #[test]
    fn test_depth_range() {
        let cal = calibrator(50.0, 650.0, 10.0, 110.0);
        assert_eq!(cal.depth_range(), (10.0, 110.0));
    }

    #[test]
    fn test_yaml_store_preserves_other_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "speech:\n  debounce_sec: 3.0\n").unwrap();

        let store = YamlCalibrationStore::new(&path);
        assert!(store.load().unwrap().is_none());

        let mut cal = DepthCalibrator::from_store(&store);
        assert_eq!(cal.mapping(), &CalibrationMapping::default());

        cal.calibrate_and_save((120.0, 5.0), (720.0, 125.0), &store)
            .unwrap();

        let reloaded = DepthCalibrator::from_store(&store);
        assert_eq!(reloaded.depth_range(), (5.0, 125.0));
        assert_eq!(reloaded.mapping().pix_top, 120.0);

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("debounce_sec"));
    }

    #[test]
    fn test_unreadable_store_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "depth_map: [1, 2, 3]\n").unwrap();

        let cal = DepthCalibrator::from_store(&YamlCalibrationStore::new(&path));
        assert_eq!(cal.mapping(), &CalibrationMapping::default());
    }
}
