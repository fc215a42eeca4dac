//! Scale invariant feature transform: difference of Gaussian extrema with
//! subpixel refinement, and the 128 dimensional gradient histogram descriptor.

use image::GrayImage;
use log::trace;
use nalgebra::{Matrix2, Matrix3, Vector3};

use super::scale_space::{downsample, gaussian_blur, orientation_peaks, pixel, to_float, FloatImage};
use crate::frame::{DescriptorMatrix, Keypoint};

pub const DESCRIPTOR_LEN: usize = HIST_WIDTH * HIST_WIDTH * ORIENTATION_BINS;
const HIST_WIDTH: usize = 4;
const ORIENTATION_BINS: usize = 8;

const LAYERS: usize = 3;
const BASE_SIGMA: f32 = 1.6;
/// Blur assumed to be present in the input image.
const INPUT_SIGMA: f32 = 0.5;
const IMAGE_BORDER: i64 = 5;
const MAX_REFINE_STEPS: usize = 5;

#[derive(Debug, Clone)]
pub struct SiftDetector {
    pub contrast_threshold: f32,
    pub edge_threshold: f32,
    /// Orientation peaks at least this fraction of the strongest one spawn a keypoint.
    pub peak_ratio: f32,
    pub max_features: Option<usize>,
}

impl Default for SiftDetector {
    fn default() -> Self {
        Self {
            contrast_threshold: 0.04,
            edge_threshold: 10.0,
            peak_ratio: 0.8,
            max_features: None,
        }
    }
}

/// Gaussian scale space, `LAYERS + 3` images per octave.
pub struct GaussianPyramid {
    octaves: Vec<Vec<FloatImage>>,
}

impl GaussianPyramid {
    pub fn build(image: &GrayImage) -> Self {
        let min_side = image.width().min(image.height()).max(1) as f32;
        let octave_count = (min_side.log2().round() as i32 - 3).max(1) as usize;

        let k = 2f32.powf(1.0 / LAYERS as f32);
        let increments = (1..LAYERS + 3)
            .map(|i| {
                let previous = BASE_SIGMA * k.powi(i as i32 - 1);
                let total = previous * k;
                (total * total - previous * previous).sqrt()
            })
            .collect::<Vec<_>>();

        let base_blur = (BASE_SIGMA * BASE_SIGMA - INPUT_SIGMA * INPUT_SIGMA).sqrt();
        let mut base = gaussian_blur(&to_float(image), base_blur);
        let mut octaves = Vec::with_capacity(octave_count);
        for _ in 0..octave_count {
            let mut layers = Vec::with_capacity(LAYERS + 3);
            layers.push(base);
            for sigma in &increments {
                let next = gaussian_blur(&layers[layers.len() - 1], *sigma);
                layers.push(next);
            }
            base = downsample(&layers[LAYERS]);
            octaves.push(layers);
        }
        Self { octaves }
    }

    /// Image and octave for a keypoint of the given diameter in base pixels.
    fn level_for(&self, size: f32) -> (&FloatImage, usize, f32) {
        let sigma = size / 2.0;
        let octave = ((sigma / BASE_SIGMA).log2().floor().max(0.0) as usize).min(self.octaves.len() - 1);
        let octave_sigma = sigma / 2f32.powi(octave as i32);
        let layer = ((LAYERS as f32 * (octave_sigma / BASE_SIGMA).log2()).round().max(0.0) as usize).min(LAYERS + 2);
        (&self.octaves[octave][layer], octave, octave_sigma)
    }
}

fn difference(a: &FloatImage, b: &FloatImage) -> FloatImage {
    FloatImage::from_fn(a.width(), a.height(), |x, y| {
        image::Luma([b.get_pixel(x, y).0[0] - a.get_pixel(x, y).0[0]])
    })
}

struct Extremum {
    x: f32,
    y: f32,
    layer: usize,
    layer_offset: f32,
    contrast: f32,
}

impl SiftDetector {
    pub fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        self.detect_in(&GaussianPyramid::build(image))
    }

    pub fn detect_in(&self, pyramid: &GaussianPyramid) -> Vec<Keypoint> {
        let threshold = 0.5 * self.contrast_threshold / LAYERS as f32;
        let mut keypoints = Vec::new();

        for (octave, gaussians) in pyramid.octaves.iter().enumerate() {
            let dogs = gaussians.windows(2).map(|w| difference(&w[0], &w[1])).collect::<Vec<_>>();
            let (width, height) = (dogs[0].width() as i64, dogs[0].height() as i64);
            let ratio = 2f32.powi(octave as i32);

            let before = keypoints.len();
            for layer in 1..=LAYERS {
                for y in IMAGE_BORDER..height - IMAGE_BORDER {
                    for x in IMAGE_BORDER..width - IMAGE_BORDER {
                        let value = pixel(&dogs[layer], x, y);
                        if value.abs() <= threshold || !is_extremum(&dogs, layer, x, y, value) {
                            continue;
                        }
                        let Some(extremum) = self.refine(&dogs, layer, x, y) else {
                            continue;
                        };

                        let octave_sigma =
                            BASE_SIGMA * 2f32.powf((extremum.layer as f32 + extremum.layer_offset) / LAYERS as f32);
                        let peaks = orientation_peaks(
                            &gaussians[extremum.layer],
                            extremum.x,
                            extremum.y,
                            1.5 * octave_sigma,
                            self.peak_ratio,
                        );
                        for angle in peaks {
                            keypoints.push(
                                Keypoint::new(extremum.x * ratio, extremum.y * ratio, 2.0 * octave_sigma * ratio)
                                    .with_response(extremum.contrast.abs())
                                    .with_angle(angle)
                                    .with_octave(octave as i32),
                            );
                        }
                    }
                }
            }
            trace!("SIFT octave {octave}: {} keypoints", keypoints.len() - before);
        }

        if let Some(limit) = self.max_features {
            keypoints.sort_by(|a, b| b.response.total_cmp(&a.response));
            keypoints.truncate(limit);
        }
        keypoints
    }

    /// Quadratic fit around a discrete extremum, rejecting unstable, low
    /// contrast and edge-like responses.
    fn refine(&self, dogs: &[FloatImage], layer: usize, x: i64, y: i64) -> Option<Extremum> {
        let (width, height) = (dogs[0].width() as i64, dogs[0].height() as i64);
        let (mut x, mut y, mut layer) = (x, y, layer);

        for _ in 0..MAX_REFINE_STEPS {
            let (gradient, hessian) = derivatives(dogs, layer, x, y);
            let offset = -(hessian.try_inverse()? * gradient);

            if offset.iter().all(|v| v.abs() < 0.5) {
                let value = pixel(&dogs[layer], x, y) + 0.5 * gradient.dot(&offset);
                if value.abs() * (LAYERS as f32) < self.contrast_threshold {
                    return None;
                }

                let spatial = Matrix2::new(hessian[(0, 0)], hessian[(0, 1)], hessian[(1, 0)], hessian[(1, 1)]);
                let (trace, det) = (spatial.trace(), spatial.determinant());
                let r = self.edge_threshold;
                if det <= 0.0 || trace * trace * r >= (r + 1.0) * (r + 1.0) * det {
                    return None;
                }

                return Some(Extremum {
                    x: x as f32 + offset[0],
                    y: y as f32 + offset[1],
                    layer,
                    layer_offset: offset[2],
                    contrast: value,
                });
            }

            x += offset[0].round() as i64;
            y += offset[1].round() as i64;
            let next_layer = layer as i64 + offset[2].round() as i64;
            if next_layer < 1
                || next_layer > LAYERS as i64
                || x < IMAGE_BORDER
                || y < IMAGE_BORDER
                || x >= width - IMAGE_BORDER
                || y >= height - IMAGE_BORDER
            {
                return None;
            }
            layer = next_layer as usize;
        }
        None
    }
}

fn is_extremum(dogs: &[FloatImage], layer: usize, x: i64, y: i64, value: f32) -> bool {
    let neighbours = (layer - 1..=layer + 1).flat_map(|l| {
        (y - 1..=y + 1).flat_map(move |ny| (x - 1..=x + 1).map(move |nx| (l, nx, ny)))
    });
    if value > 0.0 {
        neighbours.into_iter().all(|(l, nx, ny)| pixel(&dogs[l], nx, ny) <= value)
    } else {
        neighbours.into_iter().all(|(l, nx, ny)| pixel(&dogs[l], nx, ny) >= value)
    }
}

/// Gradient and Hessian in `(x, y, layer)` by central differences.
fn derivatives(dogs: &[FloatImage], layer: usize, x: i64, y: i64) -> (Vector3<f32>, Matrix3<f32>) {
    let at = |l: usize, dx: i64, dy: i64| pixel(&dogs[l], x + dx, y + dy);
    let centre = at(layer, 0, 0);

    let gradient = Vector3::new(
        0.5 * (at(layer, 1, 0) - at(layer, -1, 0)),
        0.5 * (at(layer, 0, 1) - at(layer, 0, -1)),
        0.5 * (at(layer + 1, 0, 0) - at(layer - 1, 0, 0)),
    );

    let dxx = at(layer, 1, 0) + at(layer, -1, 0) - 2.0 * centre;
    let dyy = at(layer, 0, 1) + at(layer, 0, -1) - 2.0 * centre;
    let dss = at(layer + 1, 0, 0) + at(layer - 1, 0, 0) - 2.0 * centre;
    let dxy = 0.25 * (at(layer, 1, 1) - at(layer, 1, -1) - at(layer, -1, 1) + at(layer, -1, -1));
    let dxs = 0.25 * (at(layer + 1, 1, 0) - at(layer + 1, -1, 0) - at(layer - 1, 1, 0) + at(layer - 1, -1, 0));
    let dys = 0.25 * (at(layer + 1, 0, 1) - at(layer + 1, 0, -1) - at(layer - 1, 0, 1) + at(layer - 1, 0, -1));

    let hessian = Matrix3::new(dxx, dxy, dxs, dxy, dyy, dys, dxs, dys, dss);
    (gradient, hessian)
}

/// 4x4 spatial cells of 8 orientation bins around each keypoint, trilinearly
/// interpolated, normalized and clipped at 0.2. Keypoints outside the image
/// or without a positive size are dropped.
pub fn describe(image: &GrayImage, keypoints: &[Keypoint]) -> (Vec<Keypoint>, DescriptorMatrix<f32>) {
    let pyramid = GaussianPyramid::build(image);
    let (width, height) = (image.width() as f32, image.height() as f32);

    let mut kept = Vec::with_capacity(keypoints.len());
    let mut descriptors = DescriptorMatrix::with_capacity(DESCRIPTOR_LEN, keypoints.len());
    for keypoint in keypoints {
        let (x, y) = (keypoint.x(), keypoint.y());
        if keypoint.size <= 0.0 || x < 0.0 || y < 0.0 || x >= width || y >= height {
            continue;
        }
        let (level, octave, sigma) = pyramid.level_for(keypoint.size);
        let ratio = 2f32.powi(octave as i32);
        let (ox, oy) = (x / ratio, y / ratio);

        let angle = if keypoint.has_angle() {
            keypoint.angle
        } else {
            orientation_peaks(level, ox, oy, 1.5 * sigma, 1.0)
                .first()
                .copied()
                .unwrap_or(0.0)
        };
        descriptors.push_row(&histogram_descriptor(level, ox, oy, sigma, angle));
        kept.push(*keypoint);
    }
    (kept, descriptors)
}

fn histogram_descriptor(image: &FloatImage, x: f32, y: f32, sigma: f32, angle: f32) -> [f32; DESCRIPTOR_LEN] {
    let d = HIST_WIDTH as f32;
    let n = ORIENTATION_BINS as f32;
    let cell = 3.0 * sigma;
    let radius = (cell * std::f32::consts::SQRT_2 * (d + 1.0) * 0.5).round() as i64;
    let (sin, cos) = angle.to_radians().sin_cos();
    let weight_scale = -1.0 / (0.5 * d * d);
    let (cx, cy) = (x.round() as i64, y.round() as i64);
    let (width, height) = (image.width() as i64, image.height() as i64);

    let mut histogram = [0f32; DESCRIPTOR_LEN];
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            // offset expressed in the keypoint frame, in cell units
            let col = (dx as f32 * cos + dy as f32 * sin) / cell;
            let row = (-(dx as f32) * sin + dy as f32 * cos) / cell;
            let (rbin, cbin) = (row + d / 2.0 - 0.5, col + d / 2.0 - 0.5);
            let (px, py) = (cx + dx, cy + dy);
            if rbin <= -1.0 || rbin >= d || cbin <= -1.0 || cbin >= d {
                continue;
            }
            if px <= 0 || py <= 0 || px >= width - 1 || py >= height - 1 {
                continue;
            }

            let gx = pixel(image, px + 1, py) - pixel(image, px - 1, py);
            let gy = pixel(image, px, py + 1) - pixel(image, px, py - 1);
            let magnitude = (gx * gx + gy * gy).sqrt();
            let orientation = (gy.atan2(gx).to_degrees() - angle).rem_euclid(360.0);
            let obin = orientation * n / 360.0;
            let weight = ((col * col + row * row) * weight_scale).exp() * magnitude;

            accumulate(&mut histogram, rbin, cbin, obin, weight);
        }
    }

    let norm = histogram.iter().map(|v| v * v).sum::<f32>().sqrt();
    let clip = 0.2 * norm;
    histogram.iter_mut().for_each(|v| *v = v.min(clip));
    let norm = histogram.iter().map(|v| v * v).sum::<f32>().sqrt().max(f32::EPSILON);
    histogram.iter_mut().for_each(|v| *v = (*v / norm * 512.0).round().min(255.0));
    histogram
}

/// Trilinear distribution of `weight` into the neighbouring row, column and
/// orientation bins.
fn accumulate(histogram: &mut [f32; DESCRIPTOR_LEN], rbin: f32, cbin: f32, obin: f32, weight: f32) {
    let (r0, c0, o0) = (rbin.floor(), cbin.floor(), obin.floor());
    let (dr, dc, dobin) = (rbin - r0, cbin - c0, obin - o0);
    let (r0, c0, o0) = (r0 as i64, c0 as i64, o0 as i64);

    for (r, wr) in [(r0, 1.0 - dr), (r0 + 1, dr)] {
        if r < 0 || r >= HIST_WIDTH as i64 {
            continue;
        }
        for (c, wc) in [(c0, 1.0 - dc), (c0 + 1, dc)] {
            if c < 0 || c >= HIST_WIDTH as i64 {
                continue;
            }
            for (o, wo) in [(o0, 1.0 - dobin), (o0 + 1, dobin)] {
                let o = o.rem_euclid(ORIENTATION_BINS as i64) as usize;
                let at = (r as usize * HIST_WIDTH + c as usize) * ORIENTATION_BINS + o;
                histogram[at] += weight * wr * wc * wo;
            }
        }
    }
}
