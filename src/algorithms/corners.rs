use image::GrayImage;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use log::debug;

use crate::frame::Keypoint;

/// Corner measure evaluated on the gradient structure tensor
/// `M = [Σgx², Σgxgy; Σgxgy, Σgy²]` accumulated over a `block_size` window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CornerMeasure {
    /// Smallest eigenvalue of `M`.
    ShiTomasi,
    /// `det(M) - k·trace(M)²`
    Harris { k: f32 },
}

impl CornerMeasure {
    fn response(self, sxx: f32, syy: f32, sxy: f32) -> f32 {
        match self {
            CornerMeasure::ShiTomasi => {
                let half_trace = 0.5 * (sxx + syy);
                let spread = (0.25 * (sxx - syy) * (sxx - syy) + sxy * sxy).sqrt();
                half_trace - spread
            }
            CornerMeasure::Harris { k } => {
                let trace = sxx + syy;
                sxx * syy - sxy * sxy - k * trace * trace
            }
        }
    }
}

/// Strong corner selection in the manner of "good features to track":
/// local maxima of the corner measure above `quality_level` times the strongest
/// response, greedily thinned so no two corners are closer than `min_distance`.
#[derive(Debug, Clone)]
pub struct GoodFeatures {
    pub measure: CornerMeasure,
    pub block_size: u32,
    pub quality_level: f32,
    pub min_distance: f32,
    /// `None` derives the cap from the image, `rows * cols / max(1, min_distance)`.
    pub max_corners: Option<usize>,
}

impl GoodFeatures {
    const BLOCK_SIZE: u32 = 4;
    const QUALITY_LEVEL: f32 = 0.01;
    const HARRIS_K: f32 = 0.04;
    // no overlap between neighbouring blocks
    const MAX_OVERLAP: f32 = 0.0;

    pub fn shi_tomasi() -> Self {
        Self::with_measure(CornerMeasure::ShiTomasi)
    }

    pub fn harris() -> Self {
        Self::with_measure(CornerMeasure::Harris { k: Self::HARRIS_K })
    }

    fn with_measure(measure: CornerMeasure) -> Self {
        Self {
            measure,
            block_size: Self::BLOCK_SIZE,
            quality_level: Self::QUALITY_LEVEL,
            min_distance: (1.0 - Self::MAX_OVERLAP) * Self::BLOCK_SIZE as f32,
            max_corners: None,
        }
    }

    pub fn max_corners_for(&self, image: &GrayImage) -> usize {
        self.max_corners.unwrap_or_else(|| {
            ((image.width() * image.height()) as f32 / self.min_distance.max(1.0)) as usize
        })
    }

    /// Corner response at every pixel, row-major.
    pub fn response_map(&self, image: &GrayImage) -> Vec<f32> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let gx = horizontal_sobel(image);
        let gy = vertical_sobel(image);

        // integral images of the tensor entries, one extra row and column of zeros
        let stride = width + 1;
        let mut ixx = vec![0f64; stride * (height + 1)];
        let mut iyy = vec![0f64; stride * (height + 1)];
        let mut ixy = vec![0f64; stride * (height + 1)];
        for y in 0..height {
            let (mut rxx, mut ryy, mut rxy) = (0f64, 0f64, 0f64);
            for x in 0..width {
                // scale the 3x3 Sobel response down to intensity units
                let dx = gx.get_pixel(x as u32, y as u32).0[0] as f64 / (8.0 * 255.0);
                let dy = gy.get_pixel(x as u32, y as u32).0[0] as f64 / (8.0 * 255.0);
                rxx += dx * dx;
                ryy += dy * dy;
                rxy += dx * dy;
                let at = (y + 1) * stride + x + 1;
                ixx[at] = ixx[at - stride] + rxx;
                iyy[at] = iyy[at - stride] + ryy;
                ixy[at] = ixy[at - stride] + rxy;
            }
        }

        let block = self.block_size.max(1) as usize;
        let (before, after) = (block / 2, (block - 1) / 2);
        let window_sum = |table: &[f64], x: usize, y: usize| {
            let x0 = x.saturating_sub(before);
            let y0 = y.saturating_sub(before);
            let x1 = (x + after + 1).min(width);
            let y1 = (y + after + 1).min(height);
            table[y1 * stride + x1] - table[y0 * stride + x1] - table[y1 * stride + x0]
                + table[y0 * stride + x0]
        };

        let mut response = vec![0f32; width * height];
        for y in 0..height {
            for x in 0..width {
                response[y * width + x] = self.measure.response(
                    window_sum(&ixx, x, y) as f32,
                    window_sum(&iyy, x, y) as f32,
                    window_sum(&ixy, x, y) as f32,
                );
            }
        }
        response
    }

    /// Detected corners, strongest first.
    pub fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        if width < 3 || height < 3 {
            return Vec::new();
        }

        let response = self.response_map(image);
        let strongest = response.iter().copied().fold(0.0, f32::max);
        if strongest <= 0.0 {
            return Vec::new();
        }
        let threshold = strongest * self.quality_level;

        // candidates are 3x3 local maxima above the quality threshold
        let mut candidates = Vec::new();
        for y in 1..height - 1 {
            for x in 1..width - 1 {
                let value = response[y * width + x];
                if value <= threshold {
                    continue;
                }
                let is_peak = (y - 1..=y + 1)
                    .flat_map(|ny| (x - 1..=x + 1).map(move |nx| (nx, ny)))
                    .all(|(nx, ny)| response[ny * width + nx] <= value);
                if is_peak {
                    candidates.push((value, x, y));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let max_corners = self.max_corners_for(image);
        let corners = self.thin_by_distance(&candidates, width, height, max_corners);

        debug!(
            "{:?} corners: {} candidates, {} kept",
            self.measure,
            candidates.len(),
            corners.len()
        );

        corners
            .into_iter()
            .map(|(value, x, y)| {
                Keypoint::new(x as f32, y as f32, self.block_size as f32).with_response(value)
            })
            .collect()
    }

    fn thin_by_distance(
        &self,
        candidates: &[(f32, usize, usize)],
        width: usize,
        height: usize,
        max_corners: usize,
    ) -> Vec<(f32, usize, usize)> {
        let min_distance = self.min_distance;
        if min_distance < 1.0 {
            return candidates.iter().copied().take(max_corners).collect();
        }

        // accepted corners bucketed on a grid with cells of `min_distance`
        let cell = min_distance.ceil() as usize;
        let (cols, rows) = ((width + cell - 1) / cell, (height + cell - 1) / cell);
        let mut grid: Vec<Vec<(usize, usize)>> = vec![Vec::new(); cols * rows];
        let min_sq = min_distance * min_distance;

        let mut kept = Vec::new();
        for &(value, x, y) in candidates {
            if kept.len() >= max_corners {
                break;
            }
            let (cx, cy) = (x / cell, y / cell);
            let crowded = (cy.saturating_sub(1)..=(cy + 1).min(rows - 1))
                .flat_map(|gy| (cx.saturating_sub(1)..=(cx + 1).min(cols - 1)).map(move |gx| (gx, gy)))
                .flat_map(|(gx, gy)| grid[gy * cols + gx].iter())
                .any(|&(ox, oy)| {
                    let (dx, dy) = (ox as f32 - x as f32, oy as f32 - y as f32);
                    dx * dx + dy * dy < min_sq
                });
            if !crowded {
                grid[cy * cols + cx].push((x, y));
                kept.push((value, x, y));
            }
        }
        kept
    }
}
