//! Image plumbing shared by the detectors and extractors: float planes,
//! separable Gaussian smoothing, pyramids and interpolated sampling.

use image::{
    imageops::{resize, FilterType},
    GrayImage, ImageBuffer, Luma,
};

/// Single channel floating point image, intensities in `[0, 1]` unless stated otherwise.
pub type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

pub fn to_float(image: &GrayImage) -> FloatImage {
    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        Luma([image.get_pixel(x, y).0[0] as f32 / 255.0])
    })
}

/// Normalized 1D Gaussian taps covering `±3σ`.
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as i32;
    let mut kernel = (-radius..=radius)
        .map(|i| (-((i * i) as f32) / (2.0 * sigma * sigma)).exp())
        .collect::<Vec<_>>();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|tap| *tap /= sum);
    kernel
}

/// Separable Gaussian blur with replicated borders.
pub fn gaussian_blur(image: &FloatImage, sigma: f32) -> FloatImage {
    let (width, height) = image.dimensions();
    if sigma <= 0.0 || width == 0 || height == 0 {
        return image.clone();
    }

    let kernel = gaussian_kernel(sigma);
    let half = (kernel.len() / 2) as i64;

    let horizontal: FloatImage = ImageBuffer::from_fn(width, height, |x, y| {
        let value = kernel
            .iter()
            .enumerate()
            .map(|(i, tap)| pixel(image, x as i64 + i as i64 - half, y as i64) * tap)
            .sum::<f32>();
        Luma([value])
    });

    ImageBuffer::from_fn(width, height, |x, y| {
        let value = kernel
            .iter()
            .enumerate()
            .map(|(i, tap)| pixel(&horizontal, x as i64, y as i64 + i as i64 - half) * tap)
            .sum::<f32>();
        Luma([value])
    })
}

/// Keep every second pixel in both directions.
pub fn downsample(image: &FloatImage) -> FloatImage {
    let (width, height) = ((image.width() / 2).max(1), (image.height() / 2).max(1));
    ImageBuffer::from_fn(width, height, |x, y| {
        *image.get_pixel((2 * x).min(image.width() - 1), (2 * y).min(image.height() - 1))
    })
}

/// Pixel lookup with coordinates clamped to the image.
pub fn pixel(image: &FloatImage, x: i64, y: i64) -> f32 {
    let x = x.clamp(0, image.width() as i64 - 1) as u32;
    let y = y.clamp(0, image.height() as i64 - 1) as u32;
    image.get_pixel(x, y).0[0]
}

/// Bilinear interpolation with clamped borders.
pub fn sample(image: &FloatImage, x: f32, y: f32) -> f32 {
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    let top = pixel(image, x0, y0) * (1.0 - fx) + pixel(image, x0 + 1, y0) * fx;
    let bottom = pixel(image, x0, y0 + 1) * (1.0 - fx) + pixel(image, x0 + 1, y0 + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Central difference gradient `(dx, dy)` at an integer pixel.
pub fn gradient(image: &FloatImage, x: i64, y: i64) -> (f32, f32) {
    (
        0.5 * (pixel(image, x + 1, y) - pixel(image, x - 1, y)),
        0.5 * (pixel(image, x, y + 1) - pixel(image, x, y - 1)),
    )
}

/// One level of an 8 bit image pyramid.
#[derive(Debug, Clone)]
pub struct PyramidLevel {
    pub image: GrayImage,
    /// Factor mapping level coordinates back to the base image.
    pub scale: f32,
}

/// Image pyramid with a constant scale factor between levels.
///
/// Levels too small to hold a `min_side` pixel square are not generated.
pub fn gray_pyramid(
    image: &GrayImage,
    levels: usize,
    scale_factor: f32,
    min_side: u32,
) -> Vec<PyramidLevel> {
    let mut pyramid = Vec::with_capacity(levels);
    for level in 0..levels {
        let scale = scale_factor.powi(level as i32);
        let width = (image.width() as f32 / scale).round() as u32;
        let height = (image.height() as f32 / scale).round() as u32;
        if width < min_side || height < min_side {
            break;
        }

        let image = if level == 0 {
            image.clone()
        } else {
            resize(image, width, height, FilterType::Triangle)
        };
        pyramid.push(PyramidLevel { image, scale });
    }
    pyramid
}

/// Dominant gradient orientation around `(x, y)` in degrees `[0, 360)`.
///
/// Gaussian weighted 36 bin histogram, smoothed, with parabolic peak
/// interpolation, as used for SIFT and AKAZE style orientation.
pub fn dominant_orientation(image: &FloatImage, x: f32, y: f32, sigma: f32) -> f32 {
    orientation_peaks(image, x, y, sigma, 1.0)
        .first()
        .copied()
        .unwrap_or(0.0)
}

/// Every histogram peak reaching `peak_ratio` of the strongest one, strongest first.
pub fn orientation_peaks(image: &FloatImage, x: f32, y: f32, sigma: f32, peak_ratio: f32) -> Vec<f32> {
    const BINS: usize = 36;

    let radius = (3.0 * sigma).round().max(1.0) as i64;
    let (cx, cy) = (x.round() as i64, y.round() as i64);
    let weight_scale = -1.0 / (2.0 * sigma * sigma);

    let mut histogram = [0f32; BINS];
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let (px, py) = (cx + dx, cy + dy);
            if px <= 0 || py <= 0 || px >= image.width() as i64 - 1 || py >= image.height() as i64 - 1 {
                continue;
            }
            let (gx, gy) = gradient(image, px, py);
            let magnitude = (gx * gx + gy * gy).sqrt();
            if magnitude == 0.0 {
                continue;
            }
            let angle = gy.atan2(gx).to_degrees().rem_euclid(360.0);
            let bin = ((angle / 360.0 * BINS as f32).round() as usize) % BINS;
            histogram[bin] += ((dx * dx + dy * dy) as f32 * weight_scale).exp() * magnitude;
        }
    }

    let smoothed: Vec<f32> = (0..BINS)
        .map(|i| {
            let at = |offset: i64| histogram[(i as i64 + offset).rem_euclid(BINS as i64) as usize];
            (at(-2) + at(2)) / 16.0 + (at(-1) + at(1)) * 4.0 / 16.0 + at(0) * 6.0 / 16.0
        })
        .collect();

    let max = smoothed.iter().copied().fold(0.0, f32::max);
    if max <= 0.0 {
        return Vec::new();
    }

    let mut peaks = (0..BINS)
        .filter_map(|i| {
            let left = smoothed[(i + BINS - 1) % BINS];
            let right = smoothed[(i + 1) % BINS];
            let value = smoothed[i];
            if value > left && value > right && value >= peak_ratio * max {
                let offset = 0.5 * (left - right) / (left - 2.0 * value + right);
                let angle = ((i as f32 + offset) * 360.0 / BINS as f32).rem_euclid(360.0);
                Some((value, angle))
            } else {
                None
            }
        })
        .collect::<Vec<_>>();
    peaks.sort_by(|a, b| b.0.total_cmp(&a.0));
    peaks.into_iter().map(|(_, angle)| angle).collect()
}
