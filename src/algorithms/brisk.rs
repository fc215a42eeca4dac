use std::f32::consts::TAU;

use image::{
    imageops::{resize, FilterType},
    GrayImage,
};
use log::trace;
use once_cell::sync::Lazy;

use super::{
    fast::FastDetector,
    scale_space::{gaussian_blur, sample, to_float, FloatImage},
};
use crate::frame::{DescriptorMatrix, Keypoint};

/// Bytes in a BRISK descriptor (512 short pair comparisons).
pub const DESCRIPTOR_BYTES: usize = 64;
/// Keypoint diameter at scale 1.
pub const BASE_SIZE: f32 = 12.0;

/// FAST corners searched over a fixed set of scales, then suppressed across scales.
#[derive(Debug, Clone)]
pub struct BriskDetector {
    pub threshold: u8,
    pub scales: Vec<f32>,
    /// A corner is dropped when a stronger one at any scale lies closer than this.
    pub suppression_radius: f32,
}

impl Default for BriskDetector {
    fn default() -> Self {
        Self {
            threshold: 30,
            scales: vec![1.0, 1.5, 2.0, 3.0, 4.0, 6.0],
            suppression_radius: 4.0,
        }
    }
}

impl BriskDetector {
    pub fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        let fast = FastDetector::new(self.threshold, true);

        let mut candidates = Vec::new();
        for &scale in &self.scales {
            let width = (image.width() as f32 / scale).round() as u32;
            let height = (image.height() as f32 / scale).round() as u32;
            // FAST needs a 7x7 neighbourhood
            if width < 7 || height < 7 {
                break;
            }
            let layer = if scale == 1.0 {
                image.clone()
            } else {
                resize(image, width, height, FilterType::Triangle)
            };

            let before = candidates.len();
            candidates.extend(fast.corners(&layer).into_iter().map(|corner| {
                Keypoint::new(corner.x as f32 * scale, corner.y as f32 * scale, BASE_SIZE * scale)
                    .with_response(corner.score)
            }));
            trace!("BRISK scale {scale}: {} corners", candidates.len() - before);
        }

        candidates.sort_by(|a, b| b.response.total_cmp(&a.response));
        suppress_across_scales(candidates, image.width(), image.height(), self.suppression_radius)
    }
}

/// Greedy suppression on a grid, strongest first. `candidates` must be sorted
/// by descending response.
fn suppress_across_scales(candidates: Vec<Keypoint>, width: u32, height: u32, radius: f32) -> Vec<Keypoint> {
    if radius <= 0.0 {
        return candidates;
    }
    let cell = radius.ceil() as usize;
    let cols = width as usize / cell + 1;
    let rows = height as usize / cell + 1;
    let mut grid: Vec<Vec<(f32, f32)>> = vec![Vec::new(); cols * rows];

    let mut kept = Vec::new();
    for keypoint in candidates {
        let (x, y) = (keypoint.x(), keypoint.y());
        let (cx, cy) = ((x as usize / cell).min(cols - 1), (y as usize / cell).min(rows - 1));
        let crowded = (cy.saturating_sub(1)..=(cy + 1).min(rows - 1))
            .flat_map(|gy| (cx.saturating_sub(1)..=(cx + 1).min(cols - 1)).map(move |gx| gy * cols + gx))
            .flat_map(|at| grid[at].iter())
            .any(|&(ox, oy)| (ox - x).powi(2) + (oy - y).powi(2) < radius * radius);
        if !crowded {
            grid[cy * cols + cx].push((x, y));
            kept.push(keypoint);
        }
    }
    kept
}

struct SamplingPattern {
    /// Concentric sampling points at scale 1.
    points: Vec<(f32, f32)>,
    /// The 512 shortest pairs, one descriptor bit each.
    short_pairs: Vec<(usize, usize)>,
    /// Pairs long enough to estimate the local gradient for orientation.
    long_pairs: Vec<(usize, usize)>,
}

const RING_RADII: [f32; 5] = [0.0, 2.9, 4.9, 7.4, 10.8];
const RING_POINTS: [usize; 5] = [1, 10, 14, 15, 20];
const LONG_PAIR_MIN: f32 = 13.67;

static PATTERN: Lazy<SamplingPattern> = Lazy::new(|| {
    let mut points = Vec::with_capacity(RING_POINTS.iter().sum());
    for (&radius, &count) in RING_RADII.iter().zip(&RING_POINTS) {
        for k in 0..count {
            let theta = k as f32 * TAU / count as f32;
            points.push((radius * theta.cos(), radius * theta.sin()));
        }
    }

    let mut pairs = Vec::new();
    for i in 0..points.len() {
        for j in i + 1..points.len() {
            let (dx, dy) = (points[j].0 - points[i].0, points[j].1 - points[i].1);
            pairs.push(((dx * dx + dy * dy).sqrt(), i, j));
        }
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let long_pairs = pairs.iter().filter(|p| p.0 > LONG_PAIR_MIN).map(|p| (p.1, p.2)).collect();
    let short_pairs = pairs.iter().take(DESCRIPTOR_BYTES * 8).map(|p| (p.1, p.2)).collect();

    SamplingPattern {
        points,
        short_pairs,
        long_pairs,
    }
});

/// Describe keypoints with the BRISK sampling pattern scaled by `size / 12`.
/// Orientation is estimated from the long pairs; keypoints whose rotated
/// pattern leaves the image are dropped.
pub fn describe(image: &GrayImage, keypoints: &[Keypoint]) -> (Vec<Keypoint>, DescriptorMatrix<u8>) {
    let smoothed = gaussian_blur(&to_float(image), 1.2);
    let (width, height) = (image.width() as f32, image.height() as f32);
    let pattern = &*PATTERN;

    let mut kept = Vec::with_capacity(keypoints.len());
    let mut descriptors = DescriptorMatrix::with_capacity(DESCRIPTOR_BYTES, keypoints.len());
    for keypoint in keypoints {
        let scale = keypoint.size / BASE_SIZE;
        let reach = RING_RADII[4] * scale + 2.0;
        let (x, y) = (keypoint.x(), keypoint.y());
        if scale <= 0.0 || x < reach || y < reach || x >= width - reach || y >= height - reach {
            continue;
        }

        let upright = sample_pattern(&smoothed, x, y, scale, 0.0, &pattern.points);
        let angle = pattern_orientation(&upright, &pattern.points, &pattern.long_pairs);
        let intensities = sample_pattern(&smoothed, x, y, scale, angle, &pattern.points);

        descriptors.push_row(&pair_bits::<DESCRIPTOR_BYTES>(&intensities, &pattern.short_pairs));
        kept.push(*keypoint);
    }
    (kept, descriptors)
}

/// Intensity at each pattern point, scaled and rotated by `angle` radians.
pub(crate) fn sample_pattern(
    image: &FloatImage,
    x: f32,
    y: f32,
    scale: f32,
    angle: f32,
    points: &[(f32, f32)],
) -> Vec<f32> {
    let (sin, cos) = angle.sin_cos();
    points
        .iter()
        .map(|&(px, py)| {
            let (px, py) = (px * scale, py * scale);
            sample(image, x + px * cos - py * sin, y + px * sin + py * cos)
        })
        .collect()
}

/// Angle in radians of the mean local gradient over `pairs`.
pub(crate) fn pattern_orientation(intensities: &[f32], points: &[(f32, f32)], pairs: &[(usize, usize)]) -> f32 {
    let (mut gx, mut gy) = (0f32, 0f32);
    for &(i, j) in pairs {
        let (dx, dy) = (points[j].0 - points[i].0, points[j].1 - points[i].1);
        let weight = (intensities[j] - intensities[i]) / (dx * dx + dy * dy);
        gx += weight * dx;
        gy += weight * dy;
    }
    gy.atan2(gx)
}

/// One bit per pair, set when the first point is brighter than the second.
pub(crate) fn pair_bits<const N: usize>(intensities: &[f32], pairs: &[(usize, usize)]) -> [u8; N] {
    let mut descriptor = [0u8; N];
    for (bit, &(i, j)) in pairs.iter().take(N * 8).enumerate() {
        if intensities[i] > intensities[j] {
            descriptor[bit / 8] |= 1 << (7 - bit % 8);
        }
    }
    descriptor
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    fn spots(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let bright = (x % 24) < 8 && (y % 20) < 6;
            Luma([if bright { 210 } else { 40 + (((x % 24) * 3 + y % 20) % 17) as u8 }])
        })
    }

    #[test]
    fn pattern_has_sixty_points_and_enough_pairs() {
        assert_eq!(PATTERN.points.len(), 60);
        assert_eq!(PATTERN.short_pairs.len(), DESCRIPTOR_BYTES * 8);
        assert!(!PATTERN.long_pairs.is_empty());
    }

    #[test]
    fn keypoints_span_several_scales_without_duplicates() {
        let keypoints = BriskDetector::default().detect(&spots(200, 160));
        assert!(!keypoints.is_empty());
        for (i, a) in keypoints.iter().enumerate() {
            assert!(a.size >= BASE_SIZE);
            for b in &keypoints[i + 1..] {
                assert!((a.position - b.position).norm() >= 4.0);
            }
        }
    }

    #[test]
    fn descriptor_ignores_in_plane_offsets_of_the_same_patch() {
        let image = spots(240, 240);
        // the pattern repeats every 24 columns and 20 rows
        let a = Keypoint::new(60.0, 60.0, 12.0);
        let b = Keypoint::new(60.0 + 48.0, 60.0 + 40.0, 12.0);
        let (kept, descriptors) = describe(&image, &[a, b]);
        assert_eq!(kept.len(), 2);
        assert_eq!(descriptors.row(0), descriptors.row(1));
    }

    #[test]
    fn oversized_or_degenerate_keypoints_are_dropped() {
        let image = spots(100, 100);
        let keypoints = [
            Keypoint::new(50.0, 50.0, 0.0),
            Keypoint::new(50.0, 50.0, 120.0),
            Keypoint::new(50.0, 50.0, 12.0),
        ];
        let (kept, descriptors) = describe(&image, &keypoints);
        assert_eq!(kept, vec![keypoints[2]]);
        assert_eq!(descriptors.rows(), 1);
    }
}
