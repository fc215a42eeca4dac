//! Accelerated-KAZE style features: Hessian determinant extrema over a
//! Gaussian scale space and the Modified Local Difference Binary descriptor.
//!
//! The nonlinear diffusion of the reference detector is approximated with
//! Gaussian smoothing, which keeps the same octave and sublevel layout.

use image::GrayImage;
use log::trace;

use super::scale_space::{downsample, dominant_orientation, gaussian_blur, pixel, sample, to_float, FloatImage};
use crate::frame::{DescriptorMatrix, Keypoint};

/// 486 bits, one per intensity and gradient comparison of the three grids.
pub const DESCRIPTOR_BYTES: usize = 61;
const GRIDS: [usize; 3] = [2, 3, 4];
/// Half side of the described patch in units of the keypoint scale.
const PATTERN_HALF: f32 = 10.0;

#[derive(Debug, Clone)]
pub struct AkazeDetector {
    pub octaves: usize,
    pub sublevels: usize,
    pub base_sigma: f32,
    /// Minimum scale normalized Hessian determinant, intensities in `[0, 1]`.
    pub threshold: f32,
}

impl Default for AkazeDetector {
    fn default() -> Self {
        Self {
            octaves: 4,
            sublevels: 4,
            base_sigma: 1.6,
            threshold: 0.001,
        }
    }
}

struct Level {
    smoothed: FloatImage,
    determinant: Vec<f32>,
    /// Smoothing in pixels of the octave the level belongs to.
    sigma: f32,
}

impl AkazeDetector {
    fn levels(&self, octave_image: &FloatImage) -> Vec<Level> {
        (0..self.sublevels)
            .map(|sublevel| {
                let sigma = self.base_sigma * 2f32.powf(sublevel as f32 / self.sublevels as f32);
                let smoothed = gaussian_blur(octave_image, sigma);
                let determinant = hessian_determinant(&smoothed, sigma);
                Level {
                    smoothed,
                    determinant,
                    sigma,
                }
            })
            .collect()
    }

    pub fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        let mut keypoints = Vec::new();
        let mut octave_image = to_float(image);

        for octave in 0..self.octaves {
            let (width, height) = (octave_image.width() as usize, octave_image.height() as usize);
            if width < 16 || height < 16 {
                break;
            }
            let ratio = 2f32.powi(octave as i32);
            let levels = self.levels(&octave_image);

            let before = keypoints.len();
            for (index, level) in levels.iter().enumerate() {
                let neighbours = [index.checked_sub(1), Some(index + 1).filter(|&i| i < levels.len())];
                for y in 1..height - 1 {
                    for x in 1..width - 1 {
                        let value = level.determinant[y * width + x];
                        if value <= self.threshold {
                            continue;
                        }
                        let spatial_peak = (y - 1..=y + 1)
                            .flat_map(|ny| (x - 1..=x + 1).map(move |nx| ny * width + nx))
                            .all(|at| level.determinant[at] <= value);
                        let scale_peak = neighbours
                            .iter()
                            .flatten()
                            .all(|&other| levels[other].determinant[y * width + x] <= value);
                        if !(spatial_peak && scale_peak) {
                            continue;
                        }

                        let angle = dominant_orientation(&level.smoothed, x as f32, y as f32, 2.5 * level.sigma);
                        keypoints.push(
                            Keypoint::new(x as f32 * ratio, y as f32 * ratio, 3.0 * level.sigma * ratio)
                                .with_response(value)
                                .with_angle(angle)
                                .with_octave(octave as i32),
                        );
                    }
                }
            }
            trace!("AKAZE octave {octave}: {} keypoints", keypoints.len() - before);

            octave_image = downsample(&gaussian_blur(&octave_image, self.base_sigma));
        }
        keypoints
    }
}

/// `σ⁴ (Lxx Lyy - Lxy²)` at every pixel, row-major.
fn hessian_determinant(image: &FloatImage, sigma: f32) -> Vec<f32> {
    let (width, height) = (image.width() as i64, image.height() as i64);
    let norm = sigma.powi(4);
    let mut determinant = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let at = |dx: i64, dy: i64| pixel(image, x + dx, y + dy);
            let centre = at(0, 0);
            let lxx = at(1, 0) - 2.0 * centre + at(-1, 0);
            let lyy = at(0, 1) - 2.0 * centre + at(0, -1);
            let lxy = 0.25 * (at(1, 1) - at(1, -1) - at(-1, 1) + at(-1, -1));
            determinant.push(norm * (lxx * lyy - lxy * lxy));
        }
    }
    determinant
}

/// Mean intensity and mean derivatives of every grid cell.
#[derive(Debug, Clone, Copy, Default)]
struct CellMeans {
    intensity: f32,
    dx: f32,
    dy: f32,
    count: u32,
}

impl CellMeans {
    fn add(&mut self, intensity: f32, dx: f32, dy: f32) {
        self.intensity += intensity;
        self.dx += dx;
        self.dy += dy;
        self.count += 1;
    }

    fn channels(&self) -> [f32; 3] {
        let n = self.count.max(1) as f32;
        [self.intensity / n, self.dx / n, self.dy / n]
    }
}

/// M-LDB over a patch of `±10 s` (`s = round(size / 2)`) steered by the
/// keypoint angle, or by the dominant orientation when it has none.
pub fn describe(image: &GrayImage, keypoints: &[Keypoint]) -> (Vec<Keypoint>, DescriptorMatrix<u8>) {
    let smoothed = gaussian_blur(&to_float(image), 1.6);
    let (width, height) = (image.width() as f32, image.height() as f32);

    let mut kept = Vec::with_capacity(keypoints.len());
    let mut descriptors = DescriptorMatrix::with_capacity(DESCRIPTOR_BYTES, keypoints.len());
    for keypoint in keypoints {
        if keypoint.size <= 0.0 {
            continue;
        }
        let scale = (0.5 * keypoint.size).round().max(1.0);
        let half = PATTERN_HALF * scale;
        let reach = half * std::f32::consts::SQRT_2 + scale + 1.0;
        let (x, y) = (keypoint.x(), keypoint.y());
        if x < reach || y < reach || x >= width - reach || y >= height - reach {
            continue;
        }

        let angle = if keypoint.has_angle() {
            keypoint.angle
        } else {
            dominant_orientation(&smoothed, x, y, 2.5 * scale)
        };
        descriptors.push_row(&mldb(&smoothed, x, y, scale, angle.to_radians()));
        kept.push(*keypoint);
    }
    (kept, descriptors)
}

fn mldb(image: &FloatImage, x: f32, y: f32, scale: f32, angle: f32) -> [u8; DESCRIPTOR_BYTES] {
    let (sin, cos) = angle.sin_cos();
    let at = |u: f32, v: f32| sample(image, x + u * cos - v * sin, y + u * sin + v * cos);

    let steps = (2.0 * PATTERN_HALF) as usize;
    let mut cells: Vec<Vec<CellMeans>> = GRIDS.iter().map(|g| vec![CellMeans::default(); g * g]).collect();
    for row in 0..steps {
        for col in 0..steps {
            // sample centres in the rotated patch, one per scale unit
            let u = (col as f32 + 0.5 - PATTERN_HALF) * scale;
            let v = (row as f32 + 0.5 - PATTERN_HALF) * scale;
            let intensity = at(u, v);
            let dx = at(u + scale, v) - at(u - scale, v);
            let dy = at(u, v + scale) - at(u, v - scale);

            for (grid, cells) in GRIDS.iter().zip(cells.iter_mut()) {
                let cx = col * grid / steps;
                let cy = row * grid / steps;
                cells[cy * grid + cx].add(intensity, dx, dy);
            }
        }
    }

    let mut descriptor = [0u8; DESCRIPTOR_BYTES];
    let mut bit = 0;
    for cells in &cells {
        let means = cells.iter().map(CellMeans::channels).collect::<Vec<_>>();
        for i in 0..means.len() {
            for j in i + 1..means.len() {
                for channel in 0..3 {
                    if means[i][channel] > means[j][channel] {
                        descriptor[bit / 8] |= 1 << (7 - bit % 8);
                    }
                    bit += 1;
                }
            }
        }
    }
    descriptor
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    fn disc(size: u32, cx: f32, cy: f32, radius: f32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
            Luma([if d <= radius { 220 } else { 30 }])
        })
    }

    #[test]
    fn grids_fill_the_descriptor_exactly() {
        let bits: usize = GRIDS.iter().map(|g| g * g * (g * g - 1) / 2 * 3).sum();
        assert_eq!(bits, 486);
        assert_eq!(DESCRIPTOR_BYTES, (bits + 7) / 8);
    }

    #[test]
    fn bright_blob_is_found_at_its_centre() {
        let keypoints = AkazeDetector::default().detect(&disc(80, 40.0, 40.0, 6.0));
        assert!(keypoints
            .iter()
            .any(|kp| (kp.x() - 40.0).abs() <= 3.0 && (kp.y() - 40.0).abs() <= 3.0));
        assert!(keypoints.iter().all(|kp| kp.response > 0.001 && kp.has_angle()));
    }

    #[test]
    fn flat_image_has_no_keypoints() {
        let flat = GrayImage::from_pixel(64, 64, Luma([100]));
        assert!(AkazeDetector::default().detect(&flat).is_empty());
    }

    #[test]
    fn descriptor_depends_on_the_patch() {
        let image = GrayImage::from_fn(140, 80, |x, y| {
            if x < 70 {
                Luma([((x / 4 + y / 4) % 2 * 180 + 20) as u8])
            } else {
                Luma([((x * 3 + y * y) % 200) as u8])
            }
        });
        let keypoints = [Keypoint::new(35.0, 40.0, 4.0), Keypoint::new(105.0, 40.0, 4.0)];
        let (kept, descriptors) = describe(&image, &keypoints);
        assert_eq!(kept.len(), 2);
        assert_eq!(descriptors.cols(), DESCRIPTOR_BYTES);
        assert_ne!(descriptors.row(0), descriptors.row(1));
    }
}
