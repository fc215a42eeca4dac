use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};

use crate::frame::Keypoint;

/// FAST-9 (Features from Accelerated Segment Test) with optional 3x3
/// non-maximum suppression on the corner score.
#[derive(Debug, Clone, Copy)]
pub struct FastDetector {
    pub threshold: u8,
    pub non_max_suppression: bool,
}

impl FastDetector {
    /// Diameter reported for every FAST keypoint, the extent of the Bresenham circle.
    pub const KEYPOINT_SIZE: f32 = 7.0;

    pub fn new(threshold: u8, non_max_suppression: bool) -> Self {
        Self {
            threshold,
            non_max_suppression,
        }
    }

    pub fn corners(&self, image: &GrayImage) -> Vec<Corner> {
        let corners = corners_fast9(image, self.threshold);
        if self.non_max_suppression {
            suppress_non_maxima(corners, image.width(), image.height())
        } else {
            corners
        }
    }

    pub fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        self.corners(image)
            .into_iter()
            .map(|Corner { x, y, score }| {
                Keypoint::new(x as f32, y as f32, Self::KEYPOINT_SIZE).with_response(score)
            })
            .collect()
    }
}

impl Default for FastDetector {
    fn default() -> Self {
        Self::new(30, true)
    }
}

/// Keep corners whose score is not beaten by any 8-connected neighbour.
/// Ties are resolved in favour of the corner that comes first in raster order.
pub fn suppress_non_maxima(corners: Vec<Corner>, width: u32, height: u32) -> Vec<Corner> {
    let (width, height) = (width as usize, height as usize);
    let mut scores = vec![f32::NEG_INFINITY; width * height];
    for corner in &corners {
        scores[corner.y as usize * width + corner.x as usize] = corner.score;
    }

    corners
        .into_iter()
        .filter(|corner| {
            let (x, y) = (corner.x as usize, corner.y as usize);
            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    if (nx, ny) == (x, y) {
                        continue;
                    }
                    let neighbour = scores[ny * width + nx];
                    if neighbour > corner.score || (neighbour == corner.score && (ny, nx) < (y, x)) {
                        return false;
                    }
                }
            }
            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bright_square() -> GrayImage {
        GrayImage::from_fn(40, 40, |x, y| {
            if (12..28).contains(&x) && (12..28).contains(&y) {
                image::Luma([230])
            } else {
                image::Luma([20])
            }
        })
    }

    #[test]
    fn flat_image_has_no_corners() {
        let flat = GrayImage::from_pixel(32, 32, image::Luma([90]));
        assert!(FastDetector::default().detect(&flat).is_empty());
    }

    #[test]
    fn square_corners_are_detected_with_their_score() {
        let keypoints = FastDetector::default().detect(&bright_square());
        assert!(!keypoints.is_empty());
        assert!(keypoints.iter().all(|kp| kp.response > 0.0 && kp.size == 7.0));
        let square_corners = [(12.0, 12.0), (27.0, 12.0), (12.0, 27.0), (27.0, 27.0)];
        let near = |kp: &Keypoint, (cx, cy): (f32, f32)| (kp.x() - cx).abs() <= 2.0 && (kp.y() - cy).abs() <= 2.0;
        assert!(keypoints
            .iter()
            .all(|kp| square_corners.iter().any(|&corner| near(kp, corner))));
        // the segment test of the backend fires on the diagonal corners only
        for (cx, cy) in [(12.0, 12.0), (27.0, 27.0)] {
            assert!(
                keypoints
                    .iter()
                    .any(|kp| (kp.x() - cx).abs() <= 2.0 && (kp.y() - cy).abs() <= 2.0),
                "no corner near ({cx}, {cy})"
            );
        }
    }

    #[test]
    fn suppression_never_adds_corners() {
        let raw = FastDetector::new(30, false).detect(&bright_square());
        let suppressed = FastDetector::new(30, true).detect(&bright_square());
        assert!(suppressed.len() <= raw.len());
    }

    #[test]
    fn equal_neighbours_keep_exactly_one() {
        let corners = vec![
            Corner::new(5, 5, 10.0),
            Corner::new(6, 5, 10.0),
            Corner::new(9, 9, 3.0),
        ];
        let kept = suppress_non_maxima(corners, 16, 16);
        assert_eq!(kept.len(), 2);
        assert_eq!((kept[0].x, kept[0].y), (5, 5));
    }
}
