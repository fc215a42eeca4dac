use std::fs;

use featr::{
    config::{DescriptorKind, DetectorKind, MatcherKind, PipelineConfig, SelectorKind},
    diagnostics::{KeypointCsvSink, MatchCsvSink},
    Pipeline,
};
use image::{GrayImage, Luma};

/// Bright squares on a dark background, shifted by `dx` pixels.
fn squares(dx: u32) -> GrayImage {
    GrayImage::from_fn(160, 120, |x, y| {
        let x = x + 40 - dx;
        if (x / 20) % 2 == 0 && (y / 20) % 2 == 0 && y > 20 && y < 100 {
            Luma([230])
        } else {
            Luma([25])
        }
    })
}

#[test]
fn sinks_write_one_file_per_kind() {
    let dir = tempfile::tempdir().unwrap();
    let keypoints_path = dir.path().join("keypoints.csv");
    let matches_path = dir.path().join("matches.csv");

    let config = PipelineConfig {
        region: None,
        ..PipelineConfig::new(
            DetectorKind::Fast,
            DescriptorKind::Orb,
            MatcherKind::BruteForce,
            SelectorKind::KBestRatio,
        )
    };
    let mut pipeline = Pipeline::new(config)
        .unwrap()
        .with_sink(Box::new(KeypointCsvSink::create(&keypoints_path).unwrap()))
        .with_sink(Box::new(MatchCsvSink::create(&matches_path).unwrap()));
    let reports = pipeline.run([squares(0), squares(2), squares(4)]).unwrap();

    let keypoints = fs::read_to_string(&keypoints_path).unwrap();
    let mut lines = keypoints.lines();
    assert_eq!(lines.next(), Some("frame_id,x,y,neighbour_size"));
    let retained = reports.iter().map(|r| r.keypoints_retained).sum::<usize>();
    assert!(retained > 0);
    assert_eq!(lines.count(), retained);

    let matches = fs::read_to_string(&matches_path).unwrap();
    let rows = matches.lines().collect::<Vec<_>>();
    assert_eq!(rows[0], "frame_id,matched_keypoints,detect_time,extract_time");
    // the first frame only primes the window
    assert_eq!(rows.len(), 3);
    for (row, report) in rows[1..].iter().zip(&reports[1..]) {
        let fields = row.split(',').collect::<Vec<_>>();
        assert_eq!(fields[0], report.frame_index.to_string());
        assert_eq!(fields[1], report.matches.unwrap().to_string());
        assert!(fields[2].parse::<f64>().unwrap() >= 0.0);
    }
}

#[test]
fn sink_creation_fails_for_missing_directories() {
    let dir = tempfile::tempdir().unwrap();
    assert!(MatchCsvSink::create(dir.path().join("missing").join("matches.csv")).is_err());
}
