use std::f32::consts::{FRAC_PI_6, TAU};

use image::GrayImage;
use once_cell::sync::Lazy;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::{
    brisk::{pair_bits, pattern_orientation, sample_pattern},
    scale_space::{gaussian_blur, to_float},
};
use crate::frame::{DescriptorMatrix, Keypoint};

/// Bytes in a FREAK descriptor (512 retina pair comparisons).
pub const DESCRIPTOR_BYTES: usize = 64;
/// Pixel radius of the outermost ring for the smallest keypoints.
const PATTERN_SCALE: f32 = 22.0;
/// Keypoint size that maps to a pattern scale of one.
const SMALLEST_KEYPOINT_SIZE: f32 = 7.0;

const RINGS: usize = 7;
const POINTS_PER_RING: usize = 6;

struct RetinaPattern {
    /// Seven rings of six points, outermost first, then the centre.
    points: Vec<(f32, f32)>,
    pairs: Vec<(usize, usize)>,
    /// Diametrically opposed points of every ring.
    orientation_pairs: Vec<(usize, usize)>,
}

static PATTERN: Lazy<RetinaPattern> = Lazy::new(|| {
    let big_r = 2.0 / 3.0;
    let small_r = 2.0 / 24.0;
    let unit = (big_r - small_r) / 21.0;
    let radii = [
        big_r,
        big_r - 6.0 * unit,
        big_r - 11.0 * unit,
        big_r - 15.0 * unit,
        big_r - 18.0 * unit,
        big_r - 20.0 * unit,
        small_r,
    ];

    let mut points = Vec::with_capacity(RINGS * POINTS_PER_RING + 1);
    for (ring, radius) in radii.iter().enumerate() {
        // alternate rings are staggered by half a step
        let offset = if ring % 2 == 1 { FRAC_PI_6 } else { 0.0 };
        for k in 0..POINTS_PER_RING {
            let theta = offset + k as f32 * TAU / POINTS_PER_RING as f32;
            points.push((radius * theta.cos(), radius * theta.sin()));
        }
    }
    points.push((0.0, 0.0));

    let mut pairs = (0..points.len())
        .flat_map(|i| (i + 1..points.len()).map(move |j| (i, j)))
        .collect::<Vec<_>>();
    pairs.shuffle(&mut StdRng::seed_from_u64(0xf2ea));
    pairs.truncate(DESCRIPTOR_BYTES * 8);

    let orientation_pairs = (0..RINGS)
        .flat_map(|ring| {
            let base = ring * POINTS_PER_RING;
            (0..POINTS_PER_RING / 2).map(move |k| (base + k, base + k + POINTS_PER_RING / 2))
        })
        .collect();

    RetinaPattern {
        points,
        pairs,
        orientation_pairs,
    }
});

/// Fast Retina Keypoint descriptor. The pattern grows with the keypoint size
/// and is steered by the gradient measured across opposed ring points.
pub fn describe(image: &GrayImage, keypoints: &[Keypoint]) -> (Vec<Keypoint>, DescriptorMatrix<u8>) {
    let smoothed = gaussian_blur(&to_float(image), 1.0);
    let (width, height) = (image.width() as f32, image.height() as f32);
    let pattern = &*PATTERN;

    let mut kept = Vec::with_capacity(keypoints.len());
    let mut descriptors = DescriptorMatrix::with_capacity(DESCRIPTOR_BYTES, keypoints.len());
    for keypoint in keypoints {
        if keypoint.size <= 0.0 {
            continue;
        }
        let scale = PATTERN_SCALE * (keypoint.size / SMALLEST_KEYPOINT_SIZE).max(1.0);
        let reach = scale * 2.0 / 3.0 + 1.0;
        let (x, y) = (keypoint.x(), keypoint.y());
        if x < reach || y < reach || x >= width - reach || y >= height - reach {
            continue;
        }

        let upright = sample_pattern(&smoothed, x, y, scale, 0.0, &pattern.points);
        let angle = pattern_orientation(&upright, &pattern.points, &pattern.orientation_pairs);
        let intensities = sample_pattern(&smoothed, x, y, scale, angle, &pattern.points);

        descriptors.push_row(&pair_bits::<DESCRIPTOR_BYTES>(&intensities, &pattern.pairs));
        kept.push(*keypoint);
    }
    (kept, descriptors)
}
