use std::f32::consts::SQRT_2;

use image::GrayImage;
use log::trace;
use once_cell::sync::Lazy;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

use super::{
    corners::{CornerMeasure, GoodFeatures},
    fast::FastDetector,
    scale_space::{gray_pyramid, sample, to_float, FloatImage},
};
use crate::frame::{DescriptorMatrix, Keypoint};

/// Bytes in an ORB descriptor (256 rotated intensity tests).
pub const DESCRIPTOR_BYTES: usize = 32;
/// Side of the patch the tests and the orientation are computed on.
pub const PATCH_SIZE: f32 = 31.0;
const HALF_PATCH: f32 = 15.0;

/// Oriented FAST keypoints ranked by Harris response on an image pyramid.
#[derive(Debug, Clone)]
pub struct OrbDetector {
    pub features: usize,
    pub scale_factor: f32,
    pub levels: usize,
    /// Keypoints closer than this to the border of their level are discarded.
    pub edge_threshold: u32,
    pub fast_threshold: u8,
}

impl Default for OrbDetector {
    fn default() -> Self {
        Self {
            features: 500,
            scale_factor: 1.2,
            levels: 8,
            edge_threshold: 31,
            fast_threshold: 20,
        }
    }
}

impl OrbDetector {
    /// Features per level, decreasing geometrically with the level area.
    fn level_quotas(&self, levels: usize) -> Vec<usize> {
        let factor = 1.0 / self.scale_factor;
        let first = self.features as f32 * (1.0 - factor) / (1.0 - factor.powi(levels as i32));

        let mut quotas = Vec::with_capacity(levels);
        let mut assigned = 0;
        for level in 0..levels.saturating_sub(1) {
            let quota = (first * factor.powi(level as i32)).round() as usize;
            quotas.push(quota);
            assigned += quota;
        }
        if levels > 0 {
            quotas.push(self.features.saturating_sub(assigned));
        }
        quotas
    }

    pub fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        let pyramid = gray_pyramid(image, self.levels, self.scale_factor, 2 * self.edge_threshold + 1);
        let quotas = self.level_quotas(pyramid.len());
        let fast = FastDetector::new(self.fast_threshold, true);
        let harris = GoodFeatures {
            measure: CornerMeasure::Harris { k: 0.04 },
            block_size: 7,
            quality_level: 0.0,
            min_distance: 0.0,
            max_corners: None,
        };

        let mut keypoints = Vec::new();
        for (level, (layer, quota)) in pyramid.iter().zip(quotas).enumerate() {
            let (width, height) = layer.image.dimensions();
            let edge = self.edge_threshold;
            let response = harris.response_map(&layer.image);

            let mut corners = fast
                .corners(&layer.image)
                .into_iter()
                .filter(|c| c.x >= edge && c.y >= edge && c.x < width - edge && c.y < height - edge)
                .map(|c| (response[(c.y * width + c.x) as usize], c.x, c.y))
                .collect::<Vec<_>>();
            corners.sort_by(|a, b| b.0.total_cmp(&a.0));
            corners.truncate(quota);
            trace!("ORB level {level}: {} keypoints", corners.len());

            let plane = to_float(&layer.image);
            keypoints.extend(corners.into_iter().map(|(value, x, y)| {
                let angle = intensity_centroid_angle(&plane, x as f32, y as f32, HALF_PATCH);
                Keypoint::new(x as f32 * layer.scale, y as f32 * layer.scale, PATCH_SIZE * layer.scale)
                    .with_response(value)
                    .with_angle(angle)
                    .with_octave(level as i32)
            }));
        }
        keypoints
    }
}

/// Orientation of the vector from `(x, y)` to the intensity centroid of the
/// surrounding disc, in degrees `[0, 360)`.
pub fn intensity_centroid_angle(image: &FloatImage, x: f32, y: f32, radius: f32) -> f32 {
    let reach = radius.ceil() as i32;
    let (mut m01, mut m10) = (0f32, 0f32);
    for dy in -reach..=reach {
        for dx in -reach..=reach {
            if (dx * dx + dy * dy) as f32 > radius * radius {
                continue;
            }
            let value = sample(image, x + dx as f32, y + dy as f32);
            m10 += dx as f32 * value;
            m01 += dy as f32 * value;
        }
    }
    m01.atan2(m10).to_degrees().rem_euclid(360.0)
}

/// Rotated BRIEF. Tests are drawn from a 31x31 patch scaled with the keypoint
/// size, steered by the keypoint angle or, when the detector gave none, by the
/// intensity centroid.
pub fn describe(image: &GrayImage, keypoints: &[Keypoint]) -> (Vec<Keypoint>, DescriptorMatrix<u8>) {
    let smoothed = to_float(&imageproc::filter::gaussian_blur_f32(image, 2.0));
    let (width, height) = (image.width() as f32, image.height() as f32);

    let mut kept = Vec::with_capacity(keypoints.len());
    let mut descriptors = DescriptorMatrix::with_capacity(DESCRIPTOR_BYTES, keypoints.len());
    for keypoint in keypoints {
        let scale = (keypoint.size / PATCH_SIZE).max(1.0);
        let reach = HALF_PATCH * scale * SQRT_2 + 1.0;
        let (x, y) = (keypoint.x(), keypoint.y());
        if x < reach || y < reach || x >= width - reach || y >= height - reach {
            continue;
        }

        let angle = if keypoint.has_angle() {
            keypoint.angle
        } else {
            intensity_centroid_angle(&smoothed, x, y, HALF_PATCH * scale)
        };
        let (sin, cos) = angle.to_radians().sin_cos();
        let steer = |(px, py): (f32, f32)| {
            let (px, py) = (px * scale, py * scale);
            sample(&smoothed, x + px * cos - py * sin, y + px * sin + py * cos)
        };

        let mut descriptor = [0u8; DESCRIPTOR_BYTES];
        for (bit, &(first, second)) in ORB_PATTERN.iter().enumerate() {
            if steer(first) < steer(second) {
                descriptor[bit / 8] |= 1 << (7 - bit % 8);
            }
        }
        descriptors.push_row(&descriptor);
        kept.push(*keypoint);
    }

    (kept, descriptors)
}

/// Test point pairs inside the unit 31x31 patch, reproducible across runs.
static ORB_PATTERN: Lazy<Vec<((f32, f32), (f32, f32))>> = Lazy::new(|| {
    let mut rng = StdRng::seed_from_u64(0x0b);
    let normal: Normal<f32> = Normal::new(0.0, PATCH_SIZE / 5.0).expect("standard deviation is positive");
    let mut draw = || normal.sample(&mut rng).round().clamp(-HALF_PATCH + 2.0, HALF_PATCH - 2.0);

    (0..DESCRIPTOR_BYTES * 8)
        .map(|_| ((draw(), draw()), (draw(), draw())))
        .collect()
});

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    fn blobs(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let v = ((x / 9) * 37 + (y / 7) * 91 + (x / 13) * (y / 11) * 17) % 256;
            Luma([v as u8])
        })
    }

    #[test]
    fn quotas_sum_to_the_feature_budget() {
        let detector = OrbDetector::default();
        let quotas = detector.level_quotas(8);
        assert_eq!(quotas.iter().sum::<usize>(), 500);
        assert!(quotas.windows(2).take(6).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn detected_keypoints_carry_level_and_orientation() {
        let keypoints = OrbDetector::default().detect(&blobs(240, 200));
        assert!(!keypoints.is_empty());
        assert!(keypoints.len() <= 500);
        for kp in &keypoints {
            assert!(kp.has_angle());
            assert!(kp.size >= PATCH_SIZE);
            assert!(kp.x() >= 31.0 && kp.y() >= 31.0);
        }
    }

    #[test]
    fn centroid_points_towards_the_bright_side() {
        let image: FloatImage = FloatImage::from_fn(40, 40, |x, _| Luma([if x > 20 { 1.0 } else { 0.0 }]));
        let angle = intensity_centroid_angle(&image, 20.0, 20.0, 15.0);
        assert!(angle < 1.0 || angle > 359.0, "angle {angle}");
    }

    #[test]
    fn descriptor_is_rotation_steered() {
        let image = blobs(160, 160);
        let upright = Keypoint::new(80.0, 80.0, 31.0).with_angle(0.0);
        let turned = Keypoint::new(80.0, 80.0, 31.0).with_angle(90.0);
        let (_, a) = describe(&image, &[upright]);
        let (_, b) = describe(&image, &[turned]);
        assert_eq!(a.rows(), 1);
        assert_ne!(a.row(0), b.row(0));
    }
}
