use featr::{
    config::{DescriptorKind, DetectorKind, MatcherKind, PipelineConfig, RegionOfInterest, SelectorKind},
    features::{detect, detector_for, filter_to_region, DescriptorExtractor, Extraction, KeypointDetector},
    frame::{DescriptorMatrix, Descriptors, Keypoint},
    Pipeline, PipelineState,
};
use image::{GrayImage, Luma};

/// Reports as many keypoints inside the default region as the top-left pixel
/// value, plus two outside of it.
struct CountingDetector;

impl KeypointDetector for CountingDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Fast
    }

    fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        let inside = image.get_pixel(0, 0)[0] as usize;
        let mut keypoints = vec![Keypoint::new(10.0, 10.0, 7.0)];
        keypoints.extend((0..inside).map(|i| Keypoint::new(540.0 + 12.0 * i as f32, 200.0, 7.0)));
        keypoints.push(Keypoint::new(900.0, 400.0, 7.0));
        keypoints
    }
}

/// One 4 byte row per keypoint, derived from its position.
struct PositionExtractor;

impl DescriptorExtractor for PositionExtractor {
    fn kind(&self) -> DescriptorKind {
        DescriptorKind::Brief
    }

    fn requires_positive_scale(&self) -> bool {
        false
    }

    fn compute(&self, _image: &GrayImage, keypoints: &[Keypoint]) -> Extraction {
        let rows = keypoints
            .iter()
            .map(|kp| [(kp.x() as u32 % 251) as u8, kp.y() as u8, 0, 0xff])
            .collect::<Vec<_>>();
        Extraction {
            keypoints: keypoints.to_vec(),
            descriptors: Descriptors::Binary(DescriptorMatrix::from_rows(4, rows)),
        }
    }
}

fn frame_with(count: u8) -> GrayImage {
    GrayImage::from_pixel(4, 4, Luma([count]))
}

fn pipeline(selector: SelectorKind) -> Pipeline {
    let config = PipelineConfig::new(DetectorKind::Fast, DescriptorKind::Brief, MatcherKind::BruteForce, selector);
    Pipeline::with_components(config, Box::new(CountingDetector), Box::new(PositionExtractor)).unwrap()
}

#[test]
fn first_frame_primes_and_second_frame_matches() {
    for selector in SelectorKind::ALL.iter().copied() {
        let mut pipeline = pipeline(selector);

        let a = pipeline.process(frame_with(3)).unwrap();
        assert_eq!(a.state, PipelineState::Priming);
        assert_eq!(a.keypoints_detected, 5);
        assert_eq!(a.keypoints_retained, 3);
        assert_eq!(a.matches, None);
        assert!(pipeline.current().unwrap().matches.is_empty());

        let b = pipeline.process(frame_with(4)).unwrap();
        assert_eq!(b.state, PipelineState::Steady);
        assert_eq!(b.keypoints_retained, 4);
        let matches = b.matches.unwrap();
        assert!(matches <= 3);
        if selector == SelectorKind::BestSingle {
            assert_eq!(matches, 3);
        }

        let current = pipeline.current().unwrap();
        assert_eq!(current.matches.len(), matches);
        assert!(current
            .matches
            .iter()
            .all(|m| m.source_index < 3 && m.reference_index < 4));
    }
}

#[test]
fn third_frame_evicts_the_first() {
    let mut pipeline = pipeline(SelectorKind::BestSingle);
    for count in [3, 4, 2] {
        pipeline.process(frame_with(count)).unwrap();
    }

    assert_eq!(pipeline.current().unwrap().index, 2);
    assert_eq!(pipeline.previous().unwrap().index, 1);
    assert_eq!(pipeline.window().len(), 2);
    assert!(pipeline.window().iter_by_recency().all(|frame| frame.index != 0));

    // each of B's four rows finds its nearest among C's two
    let matches = &pipeline.current().unwrap().matches;
    assert_eq!(matches.len(), 4);
    assert!(matches.iter().all(|m| m.source_index < 4 && m.reference_index < 2));
}

#[test]
fn empty_frames_do_not_abort_matching() {
    let mut pipeline = pipeline(SelectorKind::KBestRatio);
    pipeline.process(frame_with(0)).unwrap();
    let report = pipeline.process(frame_with(1)).unwrap();
    assert_eq!(report.state, PipelineState::Steady);
    assert_eq!(report.matches, Some(0));
}

#[test]
fn keypoint_limit_applies_after_the_region_filter() {
    let config = PipelineConfig {
        keypoint_limit: Some(2),
        ..PipelineConfig::new(
            DetectorKind::Fast,
            DescriptorKind::Brief,
            MatcherKind::BruteForce,
            SelectorKind::BestSingle,
        )
    };
    let mut pipeline =
        Pipeline::with_components(config, Box::new(CountingDetector), Box::new(PositionExtractor)).unwrap();
    let report = pipeline.process(frame_with(5)).unwrap();
    assert_eq!(report.keypoints_detected, 7);
    assert_eq!(report.keypoints_retained, 2);
    assert!(pipeline
        .current()
        .unwrap()
        .keypoints
        .iter()
        .all(|kp| RegionOfInterest::default().contains(kp.x(), kp.y())));
}

#[test]
fn flat_image_yields_no_keypoints_in_the_region() {
    let flat = GrayImage::from_pixel(96, 96, Luma([128]));
    let region = RegionOfInterest::new(16, 16, 64, 64);

    for &kind in DetectorKind::ALL {
        let detected = detect(&flat, kind);
        assert!(filter_to_region(&detected, &region).is_empty(), "{kind}");
    }
}

#[test]
fn region_filter_is_idempotent_on_real_detections() {
    let image = GrayImage::from_fn(96, 96, |x, y| {
        if (x / 12 + y / 12) % 3 == 0 {
            Luma([220])
        } else {
            Luma([30])
        }
    });
    let region = RegionOfInterest::new(20, 10, 50, 60);
    let detector = detector_for(DetectorKind::Fast);

    let once = filter_to_region(&detector.detect(&image), &region);
    let twice = filter_to_region(&once, &region);
    assert_eq!(once, twice);
}
