// src/preprocessing.rs
//
// Frame conditioning ahead of blob detection: single-channel intensity,
// median denoise, then tile-based contrast equalization (CLAHE).
// Everything here is deterministic for identical input.

use crate::types::CvConfig;
use image::{DynamicImage, GrayImage, Luma};
use imageproc::filter::median_filter;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessParams {
    /// Median kernel size; even values are bumped to the next odd size.
    pub blur_kernel: u32,
    /// CLAHE clip limit, relative to a flat histogram. `<= 0` disables clipping.
    pub clip_limit: f32,
    /// CLAHE tiles per axis.
    pub grid_size: u32,
}

impl From<&CvConfig> for PreprocessParams {
    fn from(cfg: &CvConfig) -> Self {
        Self {
            blur_kernel: cfg.blur_kernel,
            clip_limit: cfg.clahe_clip_limit,
            grid_size: cfg.clahe_grid_size,
        }
    }
}

impl Default for PreprocessParams {
    fn default() -> Self {
        Self::from(&CvConfig::default())
    }
}

/// Grayscale -> median blur -> CLAHE.
pub fn preprocess(frame: &DynamicImage, params: &PreprocessParams) -> GrayImage {
    let gray = frame.to_luma8();
    let blurred = median_blur(&gray, params.blur_kernel);
    clahe(&blurred, params.clip_limit, params.grid_size)
}

pub fn median_blur(gray: &GrayImage, kernel: u32) -> GrayImage {
    let radius = (kernel | 1) / 2;
    if radius == 0 {
        return gray.clone();
    }
    median_filter(gray, radius, radius)
}

// ============================================================================
// CLAHE
// ============================================================================

/// Contrast-limited adaptive histogram equalization.
///
/// The image is split into `grid × grid` tiles; each tile gets its own
/// clipped-histogram lookup table and pixels are bilinearly interpolated
/// between the four nearest tile centres.
pub fn clahe(gray: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return gray.clone();
    }

    let tile_w = width.div_ceil(grid.clamp(1, width));
    let tile_h = height.div_ceil(grid.clamp(1, height));
    // Recompute so that no tile is empty.
    let tiles_x = width.div_ceil(tile_w);
    let tiles_y = height.div_ceil(tile_h);

    let mut luts: Vec<[u8; 256]> = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);
            luts.push(tile_lut(gray, x0, y0, x1, y1, clip_limit));
        }
    }

    let mut out = GrayImage::new(width, height);
    for y in 0..height {
        let (ty1, ty2, wy) = neighbours(y, tile_h, tiles_y);
        for x in 0..width {
            let (tx1, tx2, wx) = neighbours(x, tile_w, tiles_x);
            let v = gray.get_pixel(x, y)[0] as usize;

            let lut = |tx: u32, ty: u32| luts[(ty * tiles_x + tx) as usize][v] as f32;
            let top = (1.0 - wx) * lut(tx1, ty1) + wx * lut(tx2, ty1);
            let bottom = (1.0 - wx) * lut(tx1, ty2) + wx * lut(tx2, ty2);
            let value = (1.0 - wy) * top + wy * bottom;

            out.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

/// Neighbouring tile indices along one axis and the weight of the second.
fn neighbours(coord: u32, tile: u32, tiles: u32) -> (u32, u32, f32) {
    let pos = (coord as f32 + 0.5) / tile as f32 - 0.5;
    let first = pos.floor();
    let weight = pos - first;
    let last = (tiles - 1) as f32;
    let t1 = first.clamp(0.0, last) as u32;
    let t2 = (first + 1.0).clamp(0.0, last) as u32;
    (t1, t2, weight)
}

fn tile_lut(gray: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32, clip_limit: f32) -> [u8; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[gray.get_pixel(x, y)[0] as usize] += 1;
        }
    }
    let area = (x1 - x0) * (y1 - y0);

    if clip_limit > 0.0 {
        let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
        clip_histogram(&mut hist, limit);
    }

    let scale = 255.0 / area as f32;
    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    for (i, count) in hist.iter().enumerate() {
        cdf += count;
        lut[i] = (cdf as f32 * scale).round().min(255.0) as u8;
    }
    lut
}

/// Clip every bin at `limit` and spread the excess evenly over all bins.
fn clip_histogram(hist: &mut [u32; 256], limit: u32) {
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }

    let batch = excess / 256;
    let residual = excess % 256;
    for bin in hist.iter_mut() {
        *bin += batch;
    }
    if residual > 0 {
        let step = (256 / residual).max(1) as usize;
        for bin in hist.iter_mut().step_by(step).take(residual as usize) {
            *bin += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use imageproc::drawing::draw_filled_circle_mut;

    fn noisy_rgb(width: u32, height: u32) -> DynamicImage {
        // Deterministic pseudo-noise
        let mut seed = 12345u32;
        let img = RgbImage::from_fn(width, height, |_, _| {
            seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
            let v = (seed >> 16) as u8;
            image::Rgb([v, v.wrapping_add(40), v.wrapping_sub(40)])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_preprocess_output_shape() {
        let frame = noisy_rgb(80, 60);
        let processed = preprocess(&frame, &PreprocessParams::default());
        assert_eq!(processed.dimensions(), (80, 60));
    }

    #[test]
    fn test_preprocess_is_deterministic() {
        let frame = noisy_rgb(64, 48);
        let params = PreprocessParams::default();
        assert_eq!(preprocess(&frame, &params), preprocess(&frame, &params));
    }

    #[test]
    fn test_median_blur_removes_salt() {
        let mut gray = GrayImage::new(9, 9);
        gray.put_pixel(4, 4, Luma([255]));
        let blurred = median_blur(&gray, 3);
        assert_eq!(blurred.get_pixel(4, 4)[0], 0);

        // kernel 1 is a no-op, even kernels round up to the next odd size
        assert_eq!(median_blur(&gray, 1), gray);
        assert_eq!(median_blur(&gray, 2).get_pixel(4, 4)[0], 0);
        assert_eq!(median_blur(&gray, 4).get_pixel(4, 4)[0], 0);
    }

    #[test]
    fn test_clahe_constant_image_stays_constant() {
        let gray = GrayImage::from_pixel(64, 64, Luma([0]));
        let out = clahe(&gray, 2.0, 8);
        let first = out.get_pixel(0, 0)[0];
        assert!(out.pixels().all(|p| p[0] == first));
        // A flat black tile maps to near-black.
        assert!(first < 10);
    }

    #[test]
    fn test_clahe_keeps_bright_blob_bright() {
        let mut gray = GrayImage::from_pixel(160, 160, Luma([0]));
        draw_filled_circle_mut(&mut gray, (80, 80), 20, Luma([200]));
        let out = clahe(&gray, 2.0, 8);
        assert!(out.get_pixel(80, 80)[0] > 150);
        assert!(out.get_pixel(5, 5)[0] < 10);
    }

    #[test]
    fn test_clahe_handles_grid_larger_than_image() {
        let gray = GrayImage::from_pixel(5, 3, Luma([90]));
        let out = clahe(&gray, 2.0, 8);
        assert_eq!(out.dimensions(), (5, 3));
    }

    #[test]
    fn test_clip_histogram_conserves_mass() {
        let mut hist = [0u32; 256];
        hist[0] = 5000;
        hist[200] = 1000;
        clip_histogram(&mut hist, 58);
        assert_eq!(hist.iter().sum::<u32>(), 6000);
        assert!(hist[0] <= 58 + 6000 / 256 + 1);
    }
}
