// src/detection/blob_detector.rs
//
// Classical segmentation of a preprocessed sonar frame into fish/school
// candidates:
//
//   1. Adaptive threshold against a Gaussian-weighted local mean
//   2. Morphological close, then open (fills gaps, drops speckle)
//   3. Fill enclosed holes so each outer contour is one solid region
//   4. Connected components + outer contours -> per-region metrics
//
// Echo returns from large schools often threshold as rings (the flat
// interior matches its own local mean), which is why step 3 matters:
// area and density are measured over everything the outer contour encloses.

use crate::types::{BoundingBox, CvConfig, Detection};
use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{close, open};
use imageproc::point::Point;
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::{BTreeMap, HashSet};
use std::f64::consts::PI;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlobParams {
    /// Neighbourhood size of the adaptive threshold (odd, >= 3).
    pub block_size: u32,
    /// Subtracted from the local mean; negative values demand pixels
    /// brighter than their surroundings.
    pub bias: f32,
    /// Radius of the cross-shaped structuring element.
    pub morph_radius: u8,
    pub close_iterations: u8,
    pub open_iterations: u8,
    pub area_min: f64,
    pub area_max: f64,
    pub aspect_ratio_max: f64,
}

impl From<&CvConfig> for BlobParams {
    fn from(cfg: &CvConfig) -> Self {
        Self {
            block_size: cfg.bin_block,
            bias: cfg.bin_c,
            morph_radius: cfg.morph_radius,
            close_iterations: cfg.close_iterations,
            open_iterations: cfg.open_iterations,
            area_min: cfg.area_min,
            area_max: cfg.area_max,
            aspect_ratio_max: cfg.aspect_ratio_max,
        }
    }
}

impl Default for BlobParams {
    fn default() -> Self {
        Self::from(&CvConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
struct RegionStats {
    count: u64,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    intensity_sum: u64,
    x_sum: u64,
    y_sum: u64,
}

impl RegionStats {
    fn new(x: u32, y: u32) -> Self {
        Self {
            count: 0,
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            intensity_sum: 0,
            x_sum: 0,
            y_sum: 0,
        }
    }

    fn add(&mut self, x: u32, y: u32, intensity: u8) {
        self.count += 1;
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
        self.intensity_sum += intensity as u64;
        self.x_sum += x as u64;
        self.y_sum += y as u64;
    }

    fn bbox(&self) -> BoundingBox {
        BoundingBox::new(
            self.min_x,
            self.min_y,
            self.max_x - self.min_x + 1,
            self.max_y - self.min_y + 1,
        )
    }

    /// First-order moments over the zeroth; bbox centre when empty.
    fn centroid(&self) -> (f64, f64) {
        if self.count == 0 {
            return self.bbox().center();
        }
        let m00 = self.count as f64;
        (self.x_sum as f64 / m00, self.y_sum as f64 / m00)
    }
}

/// Segment `gray` into candidate detections. Output order is not meaningful.
pub fn detect(gray: &GrayImage, params: &BlobParams) -> Vec<Detection> {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let binary = adaptive_threshold(gray, params.block_size, params.bias);
    let cleaned = clean_mask(&binary, params);
    let filled = fill_holes(&cleaned);

    let labels = connected_components(&filled, Connectivity::Eight, Luma([0u8]));

    let mut regions: BTreeMap<u32, RegionStats> = BTreeMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0];
        if label == 0 {
            continue;
        }
        regions
            .entry(label)
            .or_insert_with(|| RegionStats::new(x, y))
            .add(x, y, gray.get_pixel(x, y)[0]);
    }

    let mut perimeters: BTreeMap<u32, f64> = BTreeMap::new();
    for contour in find_contours::<i32>(&filled) {
        if !matches!(contour.border_type, BorderType::Outer) {
            continue;
        }
        let Some(first) = contour.points.first() else {
            continue;
        };
        let label = labels.get_pixel(first.x as u32, first.y as u32)[0];
        perimeters.insert(label, contour_length(&contour.points));
    }

    let mut detections = Vec::with_capacity(regions.len());
    for (label, stats) in &regions {
        let area = stats.count as f64;
        if area < params.area_min || area > params.area_max {
            continue;
        }

        let bbox = stats.bbox();
        if bbox.aspect_ratio() > params.aspect_ratio_max {
            continue;
        }

        let perimeter = perimeters.get(label).copied().unwrap_or(0.0);
        detections.push(Detection {
            bbox,
            area,
            density: stats.intensity_sum as f64 / area,
            tightness: tightness(area, perimeter),
            centroid: stats.centroid(),
        });
    }

    debug!(
        "Blob detector: {} regions, {} kept",
        regions.len(),
        detections.len()
    );
    detections
}

/// Binarize against a Gaussian-weighted local mean: a pixel is foreground
/// when `value > mean - bias`.
pub fn adaptive_threshold(gray: &GrayImage, block_size: u32, bias: f32) -> GrayImage {
    let block = (block_size | 1).max(3);
    // Same sigma OpenCV derives for a kernel of this size.
    let sigma = 0.3 * ((block as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let mean = gaussian_blur_f32(gray, sigma);

    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let value = gray.get_pixel(x, y)[0] as f32;
        let local = mean.get_pixel(x, y)[0] as f32;
        if value > local - bias {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Close then open with a cross-shaped element. Repeating a cross of radius
/// r `n` times is the L1 ball of radius `r·n`.
fn clean_mask(binary: &GrayImage, params: &BlobParams) -> GrayImage {
    let close_k = params.morph_radius.saturating_mul(params.close_iterations);
    let open_k = params.morph_radius.saturating_mul(params.open_iterations);

    let closed = if close_k > 0 {
        close(binary, Norm::L1, close_k)
    } else {
        binary.clone()
    };
    if open_k > 0 {
        open(&closed, Norm::L1, open_k)
    } else {
        closed
    }
}

/// Mark every background pixel not 4-connected to the image border as
/// foreground.
fn fill_holes(mask: &GrayImage) -> GrayImage {
    let (width, height) = mask.dimensions();
    let inverted = GrayImage::from_fn(width, height, |x, y| {
        if mask.get_pixel(x, y)[0] == 0 {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    let background = connected_components(&inverted, Connectivity::Four, Luma([0u8]));

    let mut outside: HashSet<u32> = HashSet::new();
    for x in 0..width {
        outside.insert(background.get_pixel(x, 0)[0]);
        outside.insert(background.get_pixel(x, height - 1)[0]);
    }
    for y in 0..height {
        outside.insert(background.get_pixel(0, y)[0]);
        outside.insert(background.get_pixel(width - 1, y)[0]);
    }
    outside.remove(&0);

    GrayImage::from_fn(width, height, |x, y| {
        let label = background.get_pixel(x, y)[0];
        if label == 0 || !outside.contains(&label) {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Length of the closed polyline through `points`.
fn contour_length(points: &[Point<i32>]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let mut length = 0.0;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        let dx = (q.x - p.x) as f64;
        let dy = (q.y - p.y) as f64;
        length += (dx * dx + dy * dy).sqrt();
    }
    length
}

/// `4π·area/perimeter²`, 0 for a zero perimeter. Pixel-count areas of tiny
/// regions can exceed their boundary polygon, so the result is capped at 1.
fn tightness(area: f64, perimeter: f64) -> f64 {
    if perimeter <= 0.0 {
        return 0.0;
    }
    (4.0 * PI * area / (perimeter * perimeter)).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_circle_mut};
    use imageproc::rect::Rect;

    fn blank(width: u32, height: u32) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([0]))
    }

    #[test]
    fn test_two_circles_give_two_detections() {
        let mut frame = blank(600, 800);
        draw_filled_circle_mut(&mut frame, (200, 300), 30, Luma([200]));
        draw_filled_circle_mut(&mut frame, (420, 550), 25, Luma([180]));

        let mut detections = detect(&frame, &BlobParams::default());
        assert_eq!(detections.len(), 2, "got {:?}", detections);

        detections.sort_by(|a, b| a.area.partial_cmp(&b.area).unwrap());
        let (small, big) = (&detections[0], &detections[1]);

        let expected_big = PI * 30.0 * 30.0;
        let expected_small = PI * 25.0 * 25.0;
        assert!((big.area - expected_big).abs() / expected_big < 0.1, "{}", big.area);
        assert!((small.area - expected_small).abs() / expected_small < 0.1, "{}", small.area);

        assert!((big.density - 200.0).abs() < 10.0, "{}", big.density);
        assert!((small.density - 180.0).abs() < 10.0, "{}", small.density);

        for d in &detections {
            assert!(d.tightness > 0.75 && d.tightness <= 1.0, "{}", d.tightness);
        }

        assert!((big.centroid.0 - 200.0).abs() < 1.5);
        assert!((big.centroid.1 - 300.0).abs() < 1.5);
        assert!((small.centroid.0 - 420.0).abs() < 1.5);
        assert!((small.centroid.1 - 550.0).abs() < 1.5);
    }

    #[test]
    fn test_empty_frame_has_no_detections() {
        assert!(detect(&blank(200, 150), &BlobParams::default()).is_empty());
        assert!(detect(&GrayImage::new(0, 0), &BlobParams::default()).is_empty());
    }

    #[test]
    fn test_area_filter() {
        let mut frame = blank(300, 300);
        draw_filled_circle_mut(&mut frame, (150, 150), 40, Luma([220]));

        let params = BlobParams {
            area_max: 1000.0,
            ..BlobParams::default()
        };
        assert!(detect(&frame, &params).is_empty());

        let params = BlobParams {
            area_min: 10_000.0,
            ..BlobParams::default()
        };
        assert!(detect(&frame, &params).is_empty());
    }

    #[test]
    fn test_elongated_streak_rejected_by_aspect_ratio() {
        let mut frame = blank(400, 200);
        draw_filled_rect_mut(&mut frame, Rect::at(50, 100).of_size(240, 12), Luma([230]));
        assert!(detect(&frame, &BlobParams::default()).is_empty());

        let params = BlobParams {
            aspect_ratio_max: 50.0,
            ..BlobParams::default()
        };
        let detections = detect(&frame, &params);
        assert_eq!(detections.len(), 1);
        assert!(detections[0].tightness < 0.5);
    }

    #[test]
    fn test_ring_is_measured_as_filled_region() {
        let mut frame = blank(300, 300);
        for r in 36..=40 {
            draw_hollow_circle_mut(&mut frame, (150, 150), r, Luma([210]));
        }

        let detections = detect(&frame, &BlobParams::default());
        assert_eq!(detections.len(), 1);
        let expected = PI * 40.0 * 40.0;
        assert!((detections[0].area - expected).abs() / expected < 0.15);
        // The dark interior pulls density down.
        assert!(detections[0].density < 100.0);
    }

    #[test]
    fn test_tightness_edge_cases() {
        assert_eq!(tightness(10.0, 0.0), 0.0);
        assert!((tightness(PI * 100.0, 2.0 * PI * 10.0) - 1.0).abs() < 1e-9);
        assert_eq!(tightness(4.0, 1.0), 1.0);
    }

    #[test]
    fn test_contour_length_closed_square() {
        let square = [
            Point::new(0, 0),
            Point::new(2, 0),
            Point::new(2, 2),
            Point::new(0, 2),
        ];
        assert!((contour_length(&square) - 8.0).abs() < 1e-9);
        assert_eq!(contour_length(&[Point::new(3, 3)]), 0.0);
    }

    #[test]
    fn test_fill_holes() {
        let mut mask = blank(20, 20);
        draw_filled_rect_mut(&mut mask, Rect::at(5, 5).of_size(10, 10), Luma([255]));
        draw_filled_rect_mut(&mut mask, Rect::at(8, 8).of_size(4, 4), Luma([0]));

        let filled = fill_holes(&mask);
        assert_eq!(filled.get_pixel(10, 10)[0], 255);
        assert_eq!(filled.get_pixel(1, 1)[0], 0);
    }
}
