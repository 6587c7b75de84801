// src/detection/metrics.rs

use crate::types::{DensityClass, SchoolSize};

/// Area bounds (px²) for the small/medium/large buckets.
pub const SMALL_AREA_MAX: f64 = 1000.0;
pub const MEDIUM_AREA_MAX: f64 = 5000.0;

/// Fraction of the density threshold where "moderate" starts.
const MODERATE_BAND: f64 = 0.7;

pub fn classify_school_size(area: f64) -> SchoolSize {
    if area < SMALL_AREA_MAX {
        SchoolSize::Small
    } else if area < MEDIUM_AREA_MAX {
        SchoolSize::Medium
    } else {
        SchoolSize::Large
    }
}

/// Sparse below `0.7 × threshold`, moderate up to `threshold`, dense above.
pub fn classify_density(density: f64, threshold: f64) -> DensityClass {
    if density < threshold * MODERATE_BAND {
        DensityClass::Sparse
    } else if density < threshold {
        DensityClass::Moderate
    } else {
        DensityClass::Dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_density() {
        assert_eq!(classify_density(80.0, 140.0), DensityClass::Sparse);
        assert_eq!(classify_density(120.0, 140.0), DensityClass::Moderate);
        assert_eq!(classify_density(180.0, 140.0), DensityClass::Dense);
    }

    #[test]
    fn test_density_band_edges() {
        assert_eq!(classify_density(98.5, 140.0), DensityClass::Moderate);
        assert_eq!(classify_density(97.5, 140.0), DensityClass::Sparse);
        assert_eq!(classify_density(140.0, 140.0), DensityClass::Dense);
    }

    #[test]
    fn test_school_size() {
        assert_eq!(classify_school_size(500.0), SchoolSize::Small);
        assert_eq!(classify_school_size(1000.0), SchoolSize::Medium);
        assert_eq!(classify_school_size(2500.0), SchoolSize::Medium);
        assert_eq!(classify_school_size(5000.0), SchoolSize::Large);
        assert_eq!(classify_school_size(10000.0), SchoolSize::Large);
    }
}
