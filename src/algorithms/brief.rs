use image::GrayImage;
use once_cell::sync::Lazy;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::frame::{DescriptorMatrix, Keypoint};

/// Number of bytes in a BRIEF descriptor (256 intensity tests).
pub const DESCRIPTOR_BYTES: usize = 32;

/// Side of the square patch the tests are drawn from.
const PATCH_SIZE: i16 = 48;
/// Keypoints closer than this to the image border cannot be described.
pub const BORDER: u32 = (PATCH_SIZE / 2) as u32 + 4;
/// Smoothing applied before the binary tests, to limit sensitivity to pixel noise.
pub const SMOOTHING_SIGMA: f32 = 2.0;

/// Compute BRIEF (Binary Robust Independent Elementary Features) on a smoothed
/// grayscale image for the keypoint at `(x, y)`.
///
/// ### CAUTION
/// `N` must not exceed `BRIEF_SAMPLES.len() / u8::BITS`
pub fn compute_descriptor<const N: usize>(x: u32, y: u32, image: &GrayImage) -> [u8; N] {
    const BITS: usize = u8::BITS as _;

    let intensity = |px: i16, py: i16| {
        if px >= 0 && py >= 0 && (px as u32) < image.width() && (py as u32) < image.height() {
            image.get_pixel(px as u32, py as u32).0[0]
        } else {
            // out of bounds samples read as black, callers keep keypoints away from the border
            0
        }
    };

    let mut descriptor = [0; N];
    for (i, byte) in descriptor.iter_mut().enumerate() {
        for j in 0..BITS {
            let [p1x, p1y, p2x, p2y] = BRIEF_SAMPLES[i * BITS + j];
            let first = intensity(x as i16 + p1x, y as i16 + p1y);
            let second = intensity(x as i16 + p2x, y as i16 + p2y);

            if first < second {
                *byte |= 1 << (BITS - 1 - j);
            }
        }
    }

    descriptor
}

/// Describe every keypoint far enough from the border, returning the described
/// keypoints together with one descriptor row each.
pub fn describe(image: &GrayImage, keypoints: &[Keypoint]) -> (Vec<Keypoint>, DescriptorMatrix<u8>) {
    let smoothed = imageproc::filter::gaussian_blur_f32(image, SMOOTHING_SIGMA);
    let (width, height) = image.dimensions();

    let mut kept = Vec::with_capacity(keypoints.len());
    let mut descriptors = DescriptorMatrix::with_capacity(DESCRIPTOR_BYTES, keypoints.len());
    for keypoint in keypoints {
        let (x, y) = (keypoint.x().round(), keypoint.y().round());
        if x < BORDER as f32
            || y < BORDER as f32
            || x >= (width.saturating_sub(BORDER)) as f32
            || y >= (height.saturating_sub(BORDER)) as f32
        {
            continue;
        }

        let descriptor = compute_descriptor::<DESCRIPTOR_BYTES>(x as u32, y as u32, &smoothed);
        descriptors.push_row(&descriptor);
        kept.push(*keypoint);
    }

    (kept, descriptors)
}

/// Precomputed test locations for up to 512 BRIEF bits, each `[x1, y1, x2, y2]`
/// relative to the keypoint.
/// The values remain consistent across frames and runs, because descriptors of the
/// same point in two frames must be built from the same tests to be comparable.
static BRIEF_SAMPLES: Lazy<[[i16; 4]; 512]> = Lazy::new(|| {
    // use reproducible random numbers so that every process draws the same pattern
    let mut rng = StdRng::seed_from_u64(42);

    // isotropic Gaussian with variance S²/25 (S = patch size), truncated to the patch
    let normal_dist: Normal<f32> = Normal::new(0.0, PATCH_SIZE as f32 / 5.0)
        .expect("standard deviation is positive");
    let half = PATCH_SIZE / 2;

    let mut samples = [[0; 4]; 512];
    for sample in samples.iter_mut() {
        for coordinate in sample.iter_mut() {
            *coordinate = (normal_dist.sample(&mut rng).round() as i16).clamp(-half + 1, half - 1);
        }
    }

    samples
});
