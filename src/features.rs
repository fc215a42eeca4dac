use std::time::Instant;

use image::GrayImage;
use log::{debug, warn};

use crate::{
    algorithms::{
        akaze::{self, AkazeDetector},
        brief,
        brisk::{self, BriskDetector},
        corners::{CornerMeasure, GoodFeatures},
        fast::FastDetector,
        freak,
        orb::{self, OrbDetector},
        sift::{self, SiftDetector},
    },
    config::{DescriptorKind, DetectorKind, RegionOfInterest},
    frame::{Descriptors, Keypoint, Representation},
};

/// Produces candidate keypoints from a grayscale image.
pub trait KeypointDetector {
    fn kind(&self) -> DetectorKind;
    fn detect(&self, image: &GrayImage) -> Vec<Keypoint>;
}

impl KeypointDetector for GoodFeatures {
    fn kind(&self) -> DetectorKind {
        match self.measure {
            CornerMeasure::ShiTomasi => DetectorKind::ShiTomasi,
            CornerMeasure::Harris { .. } => DetectorKind::Harris,
        }
    }

    fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        GoodFeatures::detect(self, image)
    }
}

impl KeypointDetector for FastDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Fast
    }

    fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        FastDetector::detect(self, image)
    }
}

impl KeypointDetector for BriskDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Brisk
    }

    fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        BriskDetector::detect(self, image)
    }
}

impl KeypointDetector for OrbDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Orb
    }

    fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        OrbDetector::detect(self, image)
    }
}

impl KeypointDetector for AkazeDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Akaze
    }

    fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        AkazeDetector::detect(self, image)
    }
}

impl KeypointDetector for SiftDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Sift
    }

    fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        SiftDetector::detect(self, image)
    }
}

/// The detector registered for `kind`, with its default parameters.
pub fn detector_for(kind: DetectorKind) -> Box<dyn KeypointDetector> {
    match kind {
        DetectorKind::ShiTomasi => Box::new(GoodFeatures::shi_tomasi()),
        DetectorKind::Harris => Box::new(GoodFeatures::harris()),
        DetectorKind::Fast => Box::<FastDetector>::default(),
        DetectorKind::Brisk => Box::<BriskDetector>::default(),
        DetectorKind::Orb => Box::<OrbDetector>::default(),
        DetectorKind::Akaze => Box::<AkazeDetector>::default(),
        DetectorKind::Sift => Box::<SiftDetector>::default(),
    }
}

/// Run `detector` and normalize the group and octave labels, so output of
/// different detectors stays comparable.
pub fn detect_with(detector: &dyn KeypointDetector, image: &GrayImage) -> Vec<Keypoint> {
    let start = Instant::now();
    let mut keypoints = detector.detect(image);
    for keypoint in &mut keypoints {
        keypoint.class_id = 0;
        keypoint.octave = 0;
    }
    debug!(
        "{} detection with n={} keypoints in {:.3} ms",
        detector.kind(),
        keypoints.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    keypoints
}

pub fn detect(image: &GrayImage, kind: DetectorKind) -> Vec<Keypoint> {
    detect_with(detector_for(kind).as_ref(), image)
}

/// Keypoints inside `region`, in their original order.
pub fn filter_to_region(keypoints: &[Keypoint], region: &RegionOfInterest) -> Vec<Keypoint> {
    keypoints
        .iter()
        .filter(|kp| region.contains(kp.x(), kp.y()))
        .copied()
        .collect()
}

/// Keep the `limit` keypoints with the highest response. The sort is stable,
/// so equal responses keep their detection order.
pub fn retain_best(mut keypoints: Vec<Keypoint>, limit: usize) -> Vec<Keypoint> {
    if keypoints.len() > limit {
        keypoints.sort_by(|a, b| b.response.total_cmp(&a.response));
        keypoints.truncate(limit);
    }
    keypoints
}

/// Descriptors for the keypoints an extractor could describe.
///
/// Row `i` of `descriptors` belongs to `keypoints[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Descriptors,
}

/// Computes one descriptor row per keypoint it can describe.
pub trait DescriptorExtractor {
    fn kind(&self) -> DescriptorKind;

    fn representation(&self) -> Representation {
        self.kind().representation()
    }

    /// Whether keypoints with a non-positive size must be skipped.
    fn requires_positive_scale(&self) -> bool;

    /// Keypoints too close to the border are dropped, the returned keypoints
    /// are the described ones.
    fn compute(&self, image: &GrayImage, keypoints: &[Keypoint]) -> Extraction;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BriefExtractor;

#[derive(Debug, Clone, Copy, Default)]
pub struct OrbExtractor;

#[derive(Debug, Clone, Copy, Default)]
pub struct BriskExtractor;

#[derive(Debug, Clone, Copy, Default)]
pub struct FreakExtractor;

#[derive(Debug, Clone, Copy, Default)]
pub struct AkazeExtractor;

#[derive(Debug, Clone, Copy, Default)]
pub struct SiftExtractor;

macro_rules! binary_extractor {
    ($extractor:ident, $kind:ident, $module:ident, $positive:expr) => {
        impl DescriptorExtractor for $extractor {
            fn kind(&self) -> DescriptorKind {
                DescriptorKind::$kind
            }

            fn requires_positive_scale(&self) -> bool {
                $positive
            }

            fn compute(&self, image: &GrayImage, keypoints: &[Keypoint]) -> Extraction {
                let (keypoints, matrix) = $module::describe(image, keypoints);
                Extraction {
                    keypoints,
                    descriptors: Descriptors::Binary(matrix),
                }
            }
        }
    };
}

// BRIEF samples a fixed patch and ORB clamps its pattern scale to at least one
binary_extractor!(BriefExtractor, Brief, brief, false);
binary_extractor!(OrbExtractor, Orb, orb, false);
binary_extractor!(BriskExtractor, Brisk, brisk, true);
binary_extractor!(FreakExtractor, Freak, freak, true);
binary_extractor!(AkazeExtractor, Akaze, akaze, true);

impl DescriptorExtractor for SiftExtractor {
    fn kind(&self) -> DescriptorKind {
        DescriptorKind::Sift
    }

    fn requires_positive_scale(&self) -> bool {
        true
    }

    fn compute(&self, image: &GrayImage, keypoints: &[Keypoint]) -> Extraction {
        let (keypoints, matrix) = sift::describe(image, keypoints);
        Extraction {
            keypoints,
            descriptors: Descriptors::Float(matrix),
        }
    }
}

pub fn extractor_for(kind: DescriptorKind) -> Box<dyn DescriptorExtractor> {
    match kind {
        DescriptorKind::Brisk => Box::new(BriskExtractor),
        DescriptorKind::Brief => Box::new(BriefExtractor),
        DescriptorKind::Orb => Box::new(OrbExtractor),
        DescriptorKind::Freak => Box::new(FreakExtractor),
        DescriptorKind::Akaze => Box::new(AkazeExtractor),
        DescriptorKind::Sift => Box::new(SiftExtractor),
    }
}

/// Describe `keypoints`, flagging those with a non-positive size first.
///
/// Such keypoints are only a warning for extractors that clamp the scale, and
/// are skipped for those that need a positive one.
pub fn extract_with(extractor: &dyn DescriptorExtractor, image: &GrayImage, keypoints: &[Keypoint]) -> Extraction {
    let start = Instant::now();
    let degenerate = keypoints.iter().filter(|kp| kp.size <= 0.0).count();

    let extraction = if degenerate == 0 {
        extractor.compute(image, keypoints)
    } else if extractor.requires_positive_scale() {
        warn!(
            "{degenerate} keypoints with non-positive size skipped, {} needs a positive scale",
            extractor.kind()
        );
        let usable = keypoints.iter().filter(|kp| kp.size > 0.0).copied().collect::<Vec<_>>();
        extractor.compute(image, &usable)
    } else {
        warn!("{degenerate} keypoints with non-positive size passed to {}", extractor.kind());
        extractor.compute(image, keypoints)
    };

    debug!(
        "{} descriptor extraction for {} of {} keypoints in {:.3} ms",
        extractor.kind(),
        extraction.keypoints.len(),
        keypoints.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    extraction
}

pub fn extract(image: &GrayImage, keypoints: &[Keypoint], kind: DescriptorKind) -> Extraction {
    extract_with(extractor_for(kind).as_ref(), image, keypoints)
}
